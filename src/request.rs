use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde::Serialize;
use serde_json::{Map, Value};
use url::Url;

use crate::error::FetchError;
use crate::registry::{BackendDescriptor, Endpoint, GraphQlVar, Operation, VarType};

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([a-z_]+)\}").expect("valid placeholder pattern"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

/// A fully built upstream request.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestSpec {
    pub method: Method,
    pub url: Url,
    pub body: Option<Value>,
}

/// Named parameters substituted into an endpoint.
#[derive(Debug, Clone, Default)]
pub struct Params(BTreeMap<&'static str, String>);

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.0.insert(name, value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }
}

#[derive(Serialize)]
struct GraphQlBody<'a> {
    query: &'a str,
    variables: Map<String, Value>,
}

/// Replace every `{name}` in `template` with the URL-encoded parameter value.
pub fn substitute(template: &str, params: &Params) -> Result<String, FetchError> {
    let mut missing = None;
    let rendered = PLACEHOLDER.replace_all(template, |caps: &Captures<'_>| {
        let name = &caps[1];
        match params.get(name) {
            Some(value) => urlencoding::encode(value).into_owned(),
            None => {
                missing.get_or_insert_with(|| name.to_string());
                String::new()
            }
        }
    });

    if let Some(name) = missing {
        return Err(FetchError::MissingParam { name });
    }
    Ok(rendered.into_owned())
}

pub fn build_request(
    backend: &BackendDescriptor,
    operation: Operation,
    params: &Params,
) -> Result<RequestSpec, FetchError> {
    let endpoint = backend
        .endpoint(operation)
        .ok_or_else(|| FetchError::Unsupported {
            backend: backend.name().to_string(),
            operation,
        })?;

    match endpoint {
        Endpoint::Get(template) => {
            let path = substitute(template, params)?;
            let url = Url::parse(&format!(
                "{}{}",
                backend.base_url().trim_end_matches('/'),
                path
            ))?;
            Ok(RequestSpec {
                method: Method::Get,
                url,
                body: None,
            })
        }
        Endpoint::GraphQl {
            document,
            variables,
        } => {
            let body = GraphQlBody {
                query: document,
                variables: graphql_variables(variables, params)?,
            };
            Ok(RequestSpec {
                method: Method::Post,
                url: Url::parse(backend.base_url())?,
                body: Some(serde_json::to_value(body)?),
            })
        }
    }
}

fn graphql_variables(
    variables: &[GraphQlVar],
    params: &Params,
) -> Result<Map<String, Value>, FetchError> {
    let mut map = Map::new();
    for var in variables {
        let raw = params.get(var.param).ok_or_else(|| FetchError::MissingParam {
            name: var.param.to_string(),
        })?;
        let value = match var.ty {
            VarType::Str => Value::String(raw.to_string()),
            VarType::Int => raw
                .trim()
                .parse::<i64>()
                .map(Value::from)
                .map_err(|_| FetchError::InvalidParam {
                    name: var.param.to_string(),
                    value: raw.to_string(),
                })?,
        };
        map.insert(var.name.to_string(), value);
    }
    Ok(map)
}
