//! Parameter binding.
//!
//! # Data Flow
//! ```text
//! ParamMetadata[] (per controller method)
//!     → compiler.rs (extractors, converters, validators, fast-path shape)
//!     → CompiledParams, shared by every route entry for that method
//!     → bind(ctx) per request
//!         → payload.rs (body decoded once, only when needed)
//!         → convert.rs → dto.rs / validate.rs
//!         → argument vector
//! ```

pub mod compiler;
pub mod convert;
pub mod dto;
pub mod payload;
pub mod validate;

pub use compiler::{compile_params, CompileOptions, CompiledParams, ParamShape};
pub use dto::{CompiledDto, DtoClass, DtoField, DtoRegistry};
pub use payload::{BodyOptions, DefaultPayloadDecoder, PayloadDecoder};
pub use validate::ValidationRule;
