//! 动作执行器
//!
//! 调用前按参数 schema 校验（必填字段与顶层类型），调用时施加超时并捕获处理器 panic，
//! 所有失败统一转为 ActionError；每次调用输出结构化审计日志（JSON）。

use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use serde_json::Value;
use tokio::time::timeout;

use crate::core::ErrorKind;
use crate::tools::{ActionContext, ActionDescriptor, ActionError};

/// 动作执行器：对每次调用施加超时，并将结果映射为 ActionError
#[derive(Debug, Clone)]
pub struct ToolExecutor {
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(timeout_secs: u64) -> Self {
        Self {
            timeout: Duration::from_secs(timeout_secs.max(1)),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// 校验并执行动作；输出 JSON 审计日志
    pub async fn execute(
        &self,
        action: &ActionDescriptor,
        args: Value,
        ctx: &ActionContext,
    ) -> Result<String, ActionError> {
        let start = Instant::now();
        let args_preview = args_preview(&args);

        let result = match validate_arguments(&action.parameters, &args) {
            Err(e) => Err(e),
            Ok(()) => {
                let call = AssertUnwindSafe(action.handler.execute(args, ctx)).catch_unwind();
                match timeout(self.timeout, call).await {
                    Ok(Ok(r)) => r,
                    Ok(Err(_)) => Err(ActionError::failed(format!(
                        "action '{}' panicked",
                        action.name
                    ))),
                    Err(_) => Err(ActionError::new(
                        ErrorKind::Timeout,
                        format!("action '{}' timed out after {}s", action.name, self.timeout.as_secs()),
                    )),
                }
            }
        };

        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) if e.kind == ErrorKind::Timeout => "timeout",
            Err(e) if e.kind == ErrorKind::Validation => "invalid",
            Err(_) => "error",
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": action.name,
            "task_id": ctx.task_id,
            "ok": result.is_ok(),
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": args_preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool");
        result
    }
}

/// 按 schema 校验参数：必须是对象、必填字段存在、已声明字段的顶层类型匹配
pub fn validate_arguments(schema: &Value, args: &Value) -> Result<(), ActionError> {
    let Some(obj) = args.as_object() else {
        return Err(ActionError::validation("arguments must be a JSON object"));
    };
    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for key in required.iter().filter_map(Value::as_str) {
            if obj.get(key).map_or(true, Value::is_null) {
                return Err(ActionError::validation(format!("missing required argument '{key}'")));
            }
        }
    }
    if let Some(props) = schema.get("properties").and_then(Value::as_object) {
        for (key, value) in obj {
            if value.is_null() {
                continue;
            }
            let expected = props.get(key).and_then(|p| p.get("type"));
            if let Some(expected) = expected {
                if !type_matches(expected, value) {
                    return Err(ActionError::validation(format!(
                        "argument '{key}' must be of type {expected}"
                    )));
                }
            }
        }
    }
    Ok(())
}

fn type_matches(expected: &Value, value: &Value) -> bool {
    match expected {
        Value::String(t) => single_type_matches(t, value),
        // schemars 对 Option<T> 生成 ["string", "null"]
        Value::Array(types) => types
            .iter()
            .filter_map(Value::as_str)
            .any(|t| single_type_matches(t, value)),
        _ => true,
    }
}

fn single_type_matches(t: &str, value: &Value) -> bool {
    match t {
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::session::{EnvironmentConfig, SessionManager};
    use crate::tools::{Tool, ToolRegistry};

    struct Slow;

    #[async_trait]
    impl Tool for Slow {
        fn name(&self) -> &str {
            "slow"
        }
        fn description(&self) -> &str {
            "sleeps"
        }
        fn parameters_schema(&self) -> Value {
            json!({
                "type": "object",
                "properties": { "secs": { "type": "integer" } },
                "required": ["secs"]
            })
        }
        async fn execute(&self, args: Value, _ctx: &ActionContext) -> Result<String, ActionError> {
            let secs = args["secs"].as_u64().unwrap_or(0);
            if secs == 99 {
                panic!("boom");
            }
            tokio::time::sleep(Duration::from_secs(secs)).await;
            Ok("done".into())
        }
    }

    fn ctx() -> ActionContext {
        ActionContext {
            task_id: "t".into(),
            sessions: Arc::new(SessionManager::new(EnvironmentConfig::default())),
        }
    }

    fn slow() -> Arc<ActionDescriptor> {
        let mut reg = ToolRegistry::new();
        reg.register(Slow);
        reg.get("slow").unwrap()
    }

    #[test]
    fn test_validate_arguments() {
        let schema = json!({
            "type": "object",
            "properties": { "q": { "type": "string" }, "n": { "type": ["integer", "null"] } },
            "required": ["q"]
        });
        assert!(validate_arguments(&schema, &json!({"q": "x"})).is_ok());
        assert!(validate_arguments(&schema, &json!({"q": "x", "n": null})).is_ok());
        assert!(validate_arguments(&schema, &json!({})).is_err());
        assert!(validate_arguments(&schema, &json!({"q": 1})).is_err());
        assert!(validate_arguments(&schema, &json!({"q": "x", "n": "3"})).is_err());
        assert!(validate_arguments(&schema, &json!([1])).is_err());
    }

    #[tokio::test]
    async fn test_missing_argument_never_reaches_handler() {
        let exec = ToolExecutor::new(5);
        let err = exec.execute(&slow(), json!({}), &ctx()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_timeout_becomes_error_record() {
        let exec = ToolExecutor {
            timeout: Duration::from_millis(20),
        };
        let err = exec.execute(&slow(), json!({"secs": 5}), &ctx()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_handler_panic_is_contained() {
        let exec = ToolExecutor::new(5);
        let err = exec.execute(&slow(), json!({"secs": 99}), &ctx()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ActionFailed);
        assert!(err.message.contains("panicked"));
    }
}
