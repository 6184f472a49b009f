//! 动作参数 JSON Schema 生成（schemars 自动生成）
//!
//! 各内置动作的参数以结构体声明，一处定义同时用于 schema 生成与 serde 反序列化。

use schemars::{schema_for, JsonSchema};
use serde::Deserialize;
use serde_json::Value;

use crate::tools::ActionError;

/// terminal 参数
#[derive(Debug, Deserialize, JsonSchema)]
pub struct TerminalArgs {
    /// 要执行的 shell 命令
    pub command: String,
    /// 单条命令超时（秒），缺省使用动作默认值
    pub timeout: Option<u64>,
}

/// web_search 参数
#[derive(Debug, Deserialize, JsonSchema)]
pub struct WebSearchArgs {
    /// 搜索关键词
    pub query: String,
    /// 返回结果数（1-10，默认 5）
    pub limit: Option<u32>,
}

/// web_extract 参数
#[derive(Debug, Deserialize, JsonSchema)]
pub struct WebExtractArgs {
    /// 要抓取的 URL（http / https）
    pub url: String,
}

/// 生成适合 function calling 的参数 schema（去掉 $schema / title）
pub fn parameters_for<T: JsonSchema>() -> Value {
    let mut value = serde_json::to_value(schema_for!(T)).unwrap_or_else(|_| Value::Object(Default::default()));
    if let Some(obj) = value.as_object_mut() {
        obj.remove("$schema");
        obj.remove("title");
    }
    value
}

/// 将已校验的 JSON 参数转为具体结构体
pub fn parse_args<T: for<'de> Deserialize<'de>>(args: Value) -> Result<T, ActionError> {
    serde_json::from_value(args).map_err(|e| ActionError::validation(format!("invalid arguments: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_schema() {
        let schema = parameters_for::<TerminalArgs>();
        assert_eq!(schema["type"], "object");
        assert!(schema["properties"]["command"].is_object());
        let required: Vec<&str> = schema["required"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(Value::as_str)
            .collect();
        assert_eq!(required, vec!["command"]);
        assert!(schema.get("$schema").is_none());
    }

    #[test]
    fn test_parse_args() {
        let args: WebSearchArgs = parse_args(serde_json::json!({"query": "rust"})).unwrap();
        assert_eq!(args.query, "rust");
        assert!(args.limit.is_none());
        assert!(parse_args::<WebExtractArgs>(serde_json::json!({})).is_err());
    }
}
