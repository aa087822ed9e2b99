//! Compiles parameter metadata into argument-binding pipelines.
//!
//! # Responsibilities
//! - Close each parameter's source, key and default into one extractor
//! - Pick converters and validators once, at route registration
//! - Recognize common parameter shapes and emit a specialized binder
//! - Decode the request body at most once, and only when a parameter needs it

use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::binding::convert::{self, Converter};
use crate::binding::dto::{CompiledDto, DtoRegistry};
use crate::binding::payload::{ensure_body, BodyOptions, PayloadDecoder};
use crate::binding::validate::{compile_validator, CompiledValidator};
use crate::context::{Context, ParsedBody};
use crate::error::{RouterError, RouterResult};
use crate::metadata::{ParamMetadata, ParamSource};

type SyncExtractor = Box<dyn Fn(&Context) -> Option<Value> + Send + Sync>;
type BodyExtractor = Box<dyn Fn(Option<&ParsedBody>) -> Option<Value> + Send + Sync>;
type FastBinder = Box<dyn Fn(&Context) -> RouterResult<Vec<Value>> + Send + Sync>;

enum Extractor {
    Sync(SyncExtractor),
    Body(BodyExtractor),
}

/// Knobs for [`compile_params`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CompileOptions {
    /// Never emit a specialized binder.
    pub general_only: bool,
}

impl CompileOptions {
    pub fn general_only() -> Self {
        Self { general_only: true }
    }
}

/// Parameter-list shape recognized at compile time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamShape {
    /// No parameters at all.
    Empty,
    /// One unvalidated query or path parameter.
    SingleSimple,
    /// One body parameter instantiated as a DTO.
    SingleBodyDto,
    /// Several unvalidated query parameters.
    MultiQuery,
    General,
}

/// One parameter, ready to bind.
pub struct CompiledParam {
    pub index: usize,
    pub name: String,
    pub source: ParamSource,
    extractor: Extractor,
    converter: Option<Converter>,
    validator: Option<CompiledValidator>,
    dto: Option<Arc<CompiledDto>>,
}

impl CompiledParam {
    fn bind(&self, ctx: &Context, dto_check: bool) -> RouterResult<Value> {
        let raw = match &self.extractor {
            Extractor::Sync(extract) => extract(ctx),
            Extractor::Body(extract) => extract(ctx.parsed_body().map(|p| &**p)),
        };
        let value = convert::apply(self.converter, raw)
            .map_err(|reason| RouterError::binding(self.index, reason))?;

        if let Some(dto) = &self.dto {
            return dto
                .instantiate(value, dto_check)
                .map_err(|reason| RouterError::binding(self.index, reason));
        }
        if let Some(validator) = &self.validator {
            validator
                .validate(value.as_ref())
                .map_err(|reason| RouterError::binding(self.index, reason))?;
        }
        Ok(value.unwrap_or(Value::Null))
    }
}

impl fmt::Debug for CompiledParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledParam")
            .field("index", &self.index)
            .field("name", &self.name)
            .field("source", &self.source)
            .field("validated", &self.validator.is_some())
            .field("dto", &self.dto.as_ref().map(|d| d.identifier()))
            .finish()
    }
}

/// Compiled binding pipeline for one controller method.
pub struct CompiledParams {
    params: Vec<CompiledParam>,
    arity: usize,
    needs_body: bool,
    dto_check: bool,
    shape: ParamShape,
    fast: Option<FastBinder>,
}

impl CompiledParams {
    pub fn shape(&self) -> ParamShape {
        self.shape
    }

    /// Whether binding reads the decoded body.
    pub fn needs_body(&self) -> bool {
        self.needs_body
    }

    pub fn is_fast_path(&self) -> bool {
        self.fast.is_some()
    }

    pub fn params(&self) -> &[CompiledParam] {
        &self.params
    }

    /// Bind the argument vector for one request.
    pub async fn bind(
        &self,
        ctx: &mut Context,
        decoder: &dyn PayloadDecoder,
        options: &BodyOptions,
    ) -> RouterResult<Vec<Value>> {
        if self.needs_body {
            ensure_body(ctx, decoder, options).await?;
        }
        self.bind_ready(ctx)
    }

    /// Bind without decoding. Body parameters see whatever payload is
    /// already attached to the context.
    pub fn bind_ready(&self, ctx: &Context) -> RouterResult<Vec<Value>> {
        match &self.fast {
            Some(fast) => fast(ctx),
            None => self.bind_general(ctx),
        }
    }

    /// The per-parameter pipeline, bypassing any specialized binder.
    pub fn bind_general(&self, ctx: &Context) -> RouterResult<Vec<Value>> {
        let mut args = vec![Value::Null; self.arity];
        for param in &self.params {
            args[param.index] = param.bind(ctx, self.dto_check)?;
        }
        Ok(args)
    }
}

impl fmt::Debug for CompiledParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledParams")
            .field("shape", &self.shape)
            .field("fast", &self.fast.is_some())
            .field("needs_body", &self.needs_body)
            .field("params", &self.params)
            .finish()
    }
}

fn sync_extractor(meta: &ParamMetadata) -> SyncExtractor {
    let key = meta.key.clone();
    let default = meta.default.clone();
    match (meta.source, key) {
        (ParamSource::Query, Some(key)) => {
            Box::new(move |ctx: &Context| ctx.query_value(&key).cloned().or_else(|| default.clone()))
        }
        (ParamSource::Query, None) => Box::new(|ctx: &Context| Some(ctx.merged_query())),
        (ParamSource::Path, Some(key)) => {
            Box::new(move |ctx: &Context| ctx.param(&key).cloned().or_else(|| default.clone()))
        }
        (ParamSource::Path, None) => Box::new(|ctx: &Context| Some(Value::Object(ctx.params().clone()))),
        (ParamSource::Header, Some(key)) => Box::new(move |ctx: &Context| {
            ctx.header(&key)
                .map(|v| Value::String(v.to_string()))
                .or_else(|| default.clone())
        }),
        (ParamSource::Header, None) => Box::new(|ctx: &Context| Some(ctx.headers_object())),
        _ => match meta.extractor.clone() {
            Some(custom) => Box::new(move |ctx: &Context| (custom.0)(ctx).or_else(|| default.clone())),
            None => Box::new(move |_: &Context| default.clone()),
        },
    }
}

fn body_extractor(meta: &ParamMetadata) -> BodyExtractor {
    let key = meta.key.clone();
    let default = meta.default.clone();
    let files = meta.source == ParamSource::File;
    Box::new(move |parsed: Option<&ParsedBody>| {
        let found = parsed.and_then(|p| match (&key, files) {
            (Some(key), false) => p.body.get(key).cloned(),
            (None, false) => Some(p.body.clone()),
            (Some(key), true) => p.files.get(key).cloned(),
            (None, true) => Some(Value::Object(p.files.clone())),
        });
        found.or_else(|| default.clone())
    })
}

fn classify(params: &[ParamMetadata]) -> ParamShape {
    let simple = |p: &ParamMetadata| {
        p.key.is_some() && !p.is_validated() && !p.is_dto() && p.extractor.is_none()
    };
    match params {
        [] => ParamShape::Empty,
        [p] if matches!(p.source, ParamSource::Query | ParamSource::Path) && simple(p) => {
            ParamShape::SingleSimple
        }
        [p] if p.source == ParamSource::Body && p.is_dto() && p.key.is_none() => {
            ParamShape::SingleBodyDto
        }
        ps if ps.iter().all(|p| p.source == ParamSource::Query && simple(p)) => {
            ParamShape::MultiQuery
        }
        _ => ParamShape::General,
    }
}

/// Compile a method's parameter list.
///
/// DTO classes are resolved from `dtos`; an unregistered class, an unknown
/// rule name or a duplicate index is a configuration error.
pub fn compile_params(
    params: &[ParamMetadata],
    dto_check: bool,
    dtos: &DtoRegistry,
    options: CompileOptions,
) -> RouterResult<CompiledParams> {
    let mut compiled = Vec::with_capacity(params.len());
    let mut seen = Vec::with_capacity(params.len());
    for meta in params {
        if seen.contains(&meta.index) {
            return Err(RouterError::config(format!(
                "duplicate parameter index {} ('{}')",
                meta.index, meta.name
            )));
        }
        seen.push(meta.index);

        let dto = meta.dto.as_deref().map(|id| dtos.resolve(id)).transpose()?;
        let extractor = if meta.source.needs_body() {
            Extractor::Body(body_extractor(meta))
        } else {
            Extractor::Sync(sync_extractor(meta))
        };
        compiled.push(CompiledParam {
            index: meta.index,
            name: meta.name.clone(),
            source: meta.source,
            extractor,
            converter: convert::converter_for(meta.param_type),
            validator: compile_validator(&meta.rules, meta.message.as_deref())?,
            dto,
        });
    }

    let arity = params.iter().map(|p| p.index + 1).max().unwrap_or(0);
    let contiguous = params.iter().enumerate().all(|(i, p)| p.index == i);
    let shape = classify(params);
    let fast = if options.general_only || !contiguous {
        None
    } else {
        fast_binder(shape, params, &compiled, dto_check)
    };

    Ok(CompiledParams {
        needs_body: params.iter().any(|p| p.source.needs_body()),
        params: compiled,
        arity,
        dto_check,
        shape,
        fast,
    })
}

fn fast_binder(
    shape: ParamShape,
    params: &[ParamMetadata],
    compiled: &[CompiledParam],
    dto_check: bool,
) -> Option<FastBinder> {
    match shape {
        ParamShape::Empty => Some(Box::new(|_: &Context| Ok(Vec::new()))),
        ParamShape::SingleSimple => {
            let meta = &params[0];
            let key = meta.key.clone()?;
            let default = meta.default.clone();
            let converter = compiled[0].converter;
            let from_path = meta.source == ParamSource::Path;
            Some(Box::new(move |ctx: &Context| {
                let raw = if from_path {
                    ctx.param(&key)
                } else {
                    ctx.query_value(&key)
                };
                let raw = raw.cloned().or_else(|| default.clone());
                let value = convert::apply(converter, raw).map_err(|r| RouterError::binding(0, r))?;
                Ok(vec![value.unwrap_or(Value::Null)])
            }))
        }
        ParamShape::SingleBodyDto => {
            let dto = compiled[0].dto.clone()?;
            let default = params[0].default.clone();
            let converter = compiled[0].converter;
            Some(Box::new(move |ctx: &Context| {
                let raw = ctx
                    .parsed_body()
                    .map(|p| p.body.clone())
                    .or_else(|| default.clone());
                let value = convert::apply(converter, raw).map_err(|r| RouterError::binding(0, r))?;
                let instance = dto
                    .instantiate(value, dto_check)
                    .map_err(|r| RouterError::binding(0, r))?;
                Ok(vec![instance])
            }))
        }
        ParamShape::MultiQuery => {
            let fields: Vec<(String, Option<Value>, Option<Converter>)> = params
                .iter()
                .zip(compiled)
                .map(|(meta, c)| (meta.key.clone().unwrap_or_default(), meta.default.clone(), c.converter))
                .collect();
            Some(Box::new(move |ctx: &Context| {
                let mut args = Vec::with_capacity(fields.len());
                for (index, (key, default, converter)) in fields.iter().enumerate() {
                    let raw = ctx.query_value(key).cloned().or_else(|| default.clone());
                    let value = convert::apply(*converter, raw)
                        .map_err(|r| RouterError::binding(index, r))?;
                    args.push(value.unwrap_or(Value::Null));
                }
                Ok(args)
            }))
        }
        ParamShape::General => None,
    }
}

/// Build a JSON object from named arguments, for protocols that hand
/// arguments over by name.
pub fn named_args(params: &CompiledParams, args: &[Value]) -> Value {
    let mut map = Map::new();
    for param in params.params() {
        if let Some(value) = args.get(param.index) {
            map.insert(param.name.clone(), value.clone());
        }
    }
    Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::dto::{DtoClass, DtoField};
    use crate::binding::payload::DefaultPayloadDecoder;
    use crate::binding::validate::ValidationRule;
    use crate::context::Protocol;
    use crate::metadata::ParamType;
    use axum::body::Bytes;
    use serde_json::json;

    fn both(params: &[ParamMetadata], dtos: &DtoRegistry) -> (CompiledParams, CompiledParams) {
        let fast = compile_params(params, true, dtos, CompileOptions::default()).unwrap();
        let general = compile_params(params, true, dtos, CompileOptions::general_only()).unwrap();
        (fast, general)
    }

    fn get(query: &str) -> Context {
        Context::new(Protocol::Http, "GET", "/items").with_query_string(query)
    }

    #[test]
    fn shapes_are_classified() {
        let dtos = DtoRegistry::new();
        dtos.register(DtoClass::new("Item")).unwrap();
        let cases = [
            (vec![], ParamShape::Empty),
            (vec![ParamMetadata::query("q")], ParamShape::SingleSimple),
            (vec![ParamMetadata::path("id").number()], ParamShape::SingleSimple),
            (vec![ParamMetadata::dto("Item")], ParamShape::SingleBodyDto),
            (
                vec![ParamMetadata::query("a"), ParamMetadata::query("b")],
                ParamShape::MultiQuery,
            ),
            (
                vec![ParamMetadata::query("a").rule(ValidationRule::Required)],
                ParamShape::General,
            ),
            (
                vec![ParamMetadata::query("a"), ParamMetadata::header("x-b")],
                ParamShape::General,
            ),
        ];
        for (params, expected) in cases {
            let params: Vec<_> = params
                .into_iter()
                .enumerate()
                .map(|(i, mut p)| {
                    p.index = i;
                    p
                })
                .collect();
            let compiled = compile_params(&params, false, &dtos, CompileOptions::default()).unwrap();
            assert_eq!(compiled.shape(), expected);
            assert_eq!(compiled.is_fast_path(), expected != ParamShape::General);
        }
    }

    #[test]
    fn defaults_apply_only_to_missing_values() {
        let dtos = DtoRegistry::new();
        let params = [ParamMetadata::query("count").default_value(10)];
        let (fast, general) = both(&params, &dtos);
        for compiled in [&fast, &general] {
            assert_eq!(compiled.bind_ready(&get("count=0")).unwrap(), vec![json!("0")]);
            assert_eq!(compiled.bind_ready(&get("count=")).unwrap(), vec![json!("")]);
            assert_eq!(compiled.bind_ready(&get("")).unwrap(), vec![json!(10)]);
        }

        let ctx = Context::new(Protocol::Http, "GET", "/")
            .with_query("count", Value::Null)
            .with_query("flag", false);
        assert_eq!(general.bind_ready(&ctx).unwrap(), vec![Value::Null]);
    }

    #[test]
    fn fast_path_matches_general_path() {
        let dtos = DtoRegistry::new();
        let params = [
            ParamMetadata::query("page").number().default_value(1),
            ParamMetadata::query("limit"),
            ParamMetadata::query("tags").array(),
        ];
        let params: Vec<_> = params
            .into_iter()
            .enumerate()
            .map(|(i, mut p)| {
                p.index = i;
                p
            })
            .collect();
        let (fast, general) = both(&params, &dtos);
        assert!(fast.is_fast_path());
        assert!(!general.is_fast_path());

        for query in ["", "limit=20", "page=3&limit=5&tags=a,b", "page=2.5", "page=x", "tags="] {
            let ctx = get(query);
            let a = fast.bind_ready(&ctx).map_err(|e| e.to_string());
            let b = general.bind_ready(&ctx).map_err(|e| e.to_string());
            assert_eq!(a, b, "query {query:?}");
        }
    }

    #[test]
    fn end_to_end_defaults_keep_raw_strings() {
        let dtos = DtoRegistry::new();
        let mut limit = ParamMetadata::query("limit");
        limit.index = 1;
        let params = [ParamMetadata::query("page").default_value(1), limit];
        let compiled = compile_params(&params, false, &dtos, CompileOptions::default()).unwrap();
        assert_eq!(compiled.bind_ready(&get("limit=20")).unwrap(), vec![json!(1), json!("20")]);
    }

    #[test]
    fn failures_carry_the_parameter_index() {
        let dtos = DtoRegistry::new();
        let mut age = ParamMetadata::query("age").number().rule(ValidationRule::Min(18.0));
        age.index = 1;
        let params = [ParamMetadata::query("name"), age];
        let compiled = compile_params(&params, false, &dtos, CompileOptions::default()).unwrap();

        let err = compiled.bind_ready(&get("age=12")).unwrap_err();
        assert_eq!(err.param_index(), Some(1));
        assert_eq!(err.status(), axum::http::StatusCode::BAD_REQUEST);

        let err = compiled.bind_ready(&get("age=old")).unwrap_err();
        assert_eq!(err.param_index(), Some(1));
    }

    #[test]
    fn compile_rejects_bad_metadata() {
        let dtos = DtoRegistry::new();
        let unknown_dto = [ParamMetadata::dto("Ghost")];
        assert!(compile_params(&unknown_dto, false, &dtos, CompileOptions::default()).is_err());

        let unknown_rule = [ParamMetadata::query("a").rule_named("isUnicorn")];
        assert!(compile_params(&unknown_rule, false, &dtos, CompileOptions::default()).is_err());

        let duplicate = [ParamMetadata::query("a"), ParamMetadata::query("b")];
        assert!(compile_params(&duplicate, false, &dtos, CompileOptions::default()).is_err());
    }

    #[tokio::test]
    async fn body_dto_fast_path_matches_general_path() {
        let dtos = DtoRegistry::new();
        dtos.register(
            DtoClass::new("CreateItem")
                .field(DtoField::new("name").required())
                .field(DtoField::new("qty").of_type(ParamType::Number)),
        )
        .unwrap();
        let params = [ParamMetadata::dto("CreateItem")];
        let (fast, general) = both(&params, &dtos);
        assert!(fast.needs_body());

        for body in [r#"{"name":"bolt","qty":"4"}"#, r#"{"qty":1}"#, "[1,2]"] {
            let mut ctx = Context::new(Protocol::Http, "POST", "/items")
                .with_header("content-type", "application/json")
                .with_raw_body(Bytes::from(body));
            let a = fast
                .bind(&mut ctx, &DefaultPayloadDecoder, &BodyOptions::default())
                .await
                .map_err(|e| e.to_string());
            let b = general.bind_ready(&ctx).map_err(|e| e.to_string());
            assert_eq!(a, b, "body {body}");
        }
    }

    #[tokio::test]
    async fn mixed_sources_share_one_body_parse() {
        let dtos = DtoRegistry::new();
        let params: Vec<_> = [
            ParamMetadata::path("id").number(),
            ParamMetadata::body("title").rule(ValidationRule::NotEmpty),
            ParamMetadata::body("done").boolean().default_value(false),
            ParamMetadata::header("x-tenant"),
            ParamMetadata::custom("method", |ctx| Some(json!(ctx.method()))),
        ]
        .into_iter()
        .enumerate()
        .map(|(i, mut p)| {
            p.index = i;
            p
        })
        .collect();
        let compiled = compile_params(&params, false, &dtos, CompileOptions::default()).unwrap();
        assert_eq!(compiled.shape(), ParamShape::General);

        let mut ctx = Context::new(Protocol::Http, "PATCH", "/todos/9")
            .with_param("id", "9")
            .with_header("x-tenant", "acme")
            .with_header("content-type", "application/json")
            .with_raw_body(Bytes::from_static(br#"{"title":"write docs"}"#));
        let args = compiled
            .bind(&mut ctx, &DefaultPayloadDecoder, &BodyOptions::default())
            .await
            .unwrap();
        assert_eq!(args, vec![json!(9), json!("write docs"), json!(false), json!("acme"), json!("PATCH")]);
        assert_eq!(
            named_args(&compiled, &args)["title"],
            json!("write docs")
        );
    }
}
