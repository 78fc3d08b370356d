use http::header::{HeaderValue, CONTENT_TYPE};
use http::Method;
use serde_json::Value;

use crate::core::description::RequestDescription;
use crate::core::error::{Error, FetchResult};

/// 声明式参数
pub type Parameters = serde_json::Map<String, Value>;

/// 参数编码方式
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ParameterEncoding {
    /// GET/HEAD/DELETE 编码进查询串，其余方法编码成表单请求体
    #[default]
    Url,
    /// 序列化为 JSON 请求体
    Json,
}

impl ParameterEncoding {
    pub fn encode(
        self,
        description: RequestDescription,
        parameters: &Parameters,
    ) -> FetchResult<RequestDescription> {
        if parameters.is_empty() {
            return Ok(description);
        }
        match self {
            ParameterEncoding::Url => encode_url(description, parameters),
            ParameterEncoding::Json => encode_json(description, parameters),
        }
    }
}

fn encodes_in_query(method: &Method) -> bool {
    *method == Method::GET || *method == Method::HEAD || *method == Method::DELETE
}

fn encode_url(
    description: RequestDescription,
    parameters: &Parameters,
) -> FetchResult<RequestDescription> {
    let mut pairs = Vec::new();
    for (key, value) in parameters {
        query_components(key, value, &mut pairs);
    }

    if encodes_in_query(description.method()) {
        let mut url = description.url().clone();
        url.query_pairs_mut().extend_pairs(pairs.iter());
        return Ok(description.with_url(url));
    }

    let body = url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs.iter())
        .finish();
    let description = if description.headers().contains_key(CONTENT_TYPE) {
        description
    } else {
        description.with_header_value(
            CONTENT_TYPE,
            HeaderValue::from_static("application/x-www-form-urlencoded; charset=utf-8"),
        )
    };
    Ok(description.with_body(body))
}

fn encode_json(
    description: RequestDescription,
    parameters: &Parameters,
) -> FetchResult<RequestDescription> {
    let body = serde_json::to_vec(parameters).map_err(|e| Error::Encoding(e.to_string()))?;
    let description = if description.headers().contains_key(CONTENT_TYPE) {
        description
    } else {
        description.with_header_value(CONTENT_TYPE, HeaderValue::from_static("application/json"))
    };
    Ok(description.with_body(body))
}

/// 把嵌套的参数展开成扁平的键值对：数组为 `key[]`，对象为 `key[sub]`
fn query_components(key: &str, value: &Value, out: &mut Vec<(String, String)>) {
    match value {
        Value::Object(map) => {
            for (nested_key, nested) in map {
                query_components(&format!("{}[{}]", key, nested_key), nested, out);
            }
        }
        Value::Array(items) => {
            for item in items {
                query_components(&format!("{}[]", key), item, out);
            }
        }
        Value::Bool(flag) => out.push((key.to_string(), if *flag { "1" } else { "0" }.to_string())),
        Value::Number(number) => out.push((key.to_string(), number.to_string())),
        Value::String(text) => out.push((key.to_string(), text.clone())),
        Value::Null => out.push((key.to_string(), String::new())),
    }
}
