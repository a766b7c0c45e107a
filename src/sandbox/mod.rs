//! 执行沙箱：解释执行模型生成的代码
//!
//! `execute(code, binding)` 只读 Binding，返回本次新增/修改的用户变量、结果值、最终答案与 print 日志；
//! 任何语法/运行时/工具故障都转为 SandboxError，不会越过沙箱边界。
//! 同一段代码在同一个 Binding 快照上执行两次，得到相同的结果值与变量集合（工具自身副作用除外）。

mod binding;
mod interp;
mod lexer;
mod parser;
mod value;

use std::collections::BTreeMap;

use serde_json::Value;
use thiserror::Error;

pub use binding::Binding;
pub use value::{render_value, truthy, type_name};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SandboxError {
    #[error("SyntaxError (line {line}): {message}")]
    Syntax { line: usize, message: String },

    #[error("RuntimeError (line {line}): {message}")]
    Runtime { line: usize, message: String },

    #[error("Error calling {name}: {message}")]
    Tool { name: String, message: String },
}

/// 一次成功执行的产物
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Execution {
    /// 最后一条语句的值；给出最终答案时即为答案
    pub value: Value,
    /// 本次新增或修改的用户变量
    pub assigned: BTreeMap<String, Value>,
    pub final_answer: Option<Value>,
    pub logs: Vec<String>,
}

pub async fn execute(code: &str, binding: &Binding) -> Result<Execution, SandboxError> {
    let tokens = lexer::tokenize(code)?;
    let program = parser::parse(tokens)?;
    interp::Interpreter::new(binding).run(&program).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde_json::json;

    use crate::tools::{EchoTool, Tool, ToolRegistry};

    struct Panicky;

    #[async_trait]
    impl Tool for Panicky {
        fn name(&self) -> &str {
            "panicky"
        }

        fn description(&self) -> &str {
            "always panics"
        }

        async fn call(&self, _args: Vec<Value>) -> Result<Value, String> {
            panic!("tool exploded");
        }
    }

    struct Counter(Arc<AtomicUsize>);

    #[async_trait]
    impl Tool for Counter {
        fn name(&self) -> &str {
            "count"
        }

        fn description(&self) -> &str {
            "counts calls"
        }

        async fn call(&self, _args: Vec<Value>) -> Result<Value, String> {
            Ok(json!(self.0.fetch_add(1, Ordering::SeqCst)))
        }
    }

    fn binding() -> Binding {
        let mut tools = ToolRegistry::new();
        tools.register(EchoTool);
        tools.register(Panicky);
        Binding::new(Arc::new(tools), Arc::new(ToolRegistry::new()))
    }

    async fn run(binding: &mut Binding, code: &str) -> Result<Execution, SandboxError> {
        let exec = execute(code, binding).await?;
        binding.apply(&exec);
        Ok(exec)
    }

    #[tokio::test]
    async fn test_variables_persist_across_steps() {
        let mut b = binding();
        let first = run(&mut b, "product = 25 * 4").await.unwrap();
        assert_eq!(first.value, json!(100));
        let second = run(&mut b, "total = product + 10\ntotal").await.unwrap();
        assert_eq!(second.value, json!(110));
        assert_eq!(b.variable("product"), Some(&json!(100)));
        assert_eq!(second.assigned.keys().collect::<Vec<_>>(), vec!["total"]);
    }

    #[tokio::test]
    async fn test_final_answer_sets_sentinel() {
        let mut b = binding();
        let exec = run(&mut b, "x = 5\ntools.final_answer(x * 2)\ny = 1").await.unwrap();
        assert_eq!(exec.final_answer, Some(json!(10)));
        assert_eq!(b.final_answer(), Some(&json!(10)));
        // 最终答案之后的语句不再执行，之前的赋值保留
        assert!(b.variable("y").is_none());
        assert_eq!(b.variable("x"), Some(&json!(5)));
        b.clear_final_answer();
        assert!(b.final_answer().is_none());
    }

    #[tokio::test]
    async fn test_user_variable_cannot_shadow_tool() {
        let mut b = binding();
        run(&mut b, "echo = 5").await.unwrap();
        let exec = run(&mut b, "tools.echo(echo)").await.unwrap();
        assert_eq!(exec.value, json!("5"));
        assert!(b.tools().contains("echo"));
        assert!(execute("tools = 1", &b).await.is_err());
    }

    #[tokio::test]
    async fn test_errors_are_contained() {
        let b = binding();
        let err = execute("1 / 0", &b).await.unwrap_err();
        assert!(matches!(err, SandboxError::Runtime { line: 1, .. }));
        let err = execute("tools.panicky()", &b).await.unwrap_err();
        assert_eq!(
            err,
            SandboxError::Tool {
                name: "tools.panicky".into(),
                message: "tool panicked".into()
            }
        );
        let err = execute("tools.missing()", &b).await.unwrap_err();
        assert!(err.to_string().contains("available: [echo, panicky]"));
        assert!(matches!(
            execute("x = (", &b).await.unwrap_err(),
            SandboxError::Syntax { .. }
        ));
    }

    #[tokio::test]
    async fn test_failed_step_leaves_binding_untouched() {
        let mut b = binding();
        run(&mut b, "a = 1").await.unwrap();
        assert!(run(&mut b, "a = 2\nb = undefined_name").await.is_err());
        assert_eq!(b.variable("a"), Some(&json!(1)));
        assert!(b.variable("b").is_none());
    }

    #[tokio::test]
    async fn test_same_snapshot_same_result() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut tools = ToolRegistry::new();
        tools.register(Counter(calls.clone()));
        let b = Binding::new(Arc::new(tools), Arc::new(ToolRegistry::new()))
            .with_variables([("base".to_string(), json!(3))].into_iter().collect());
        let code = "doubled = base * 2\nlabel = 'v' + str(doubled)";
        let first = execute(code, &b).await.unwrap();
        let second = execute(code, &b).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.value, json!("v6"));
    }

    #[tokio::test]
    async fn test_control_flow_and_builtins() {
        let b = binding();
        let code = r#"
total = 0
for n in range(1, 5) {
    if n % 2 == 0 {
        total = total + n
    } else {
        print("odd", n)
    }
}
data = {"items": [3, 1, 2], "name": "x"}
[total, max(data.items), len(data["name"]), round(2.346, 2), int("7") + 1]
"#;
        let exec = execute(code, &b).await.unwrap();
        assert_eq!(exec.value, json!([6, 3, 1, 2.35, 8]));
        assert_eq!(exec.logs, vec!["odd 1", "odd 3"]);
    }

    #[tokio::test]
    async fn test_long_operator_chain_is_a_syntax_error() {
        let code = format!("x = 1{}", " + 1".repeat(5000));
        let handle = tokio::spawn(async move { execute(&code, &binding()).await });
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(SandboxError::Syntax { .. })));
    }

    #[tokio::test]
    async fn test_growing_values_hit_size_limit() {
        let b = binding();
        let err = execute("s = 'ab'\nfor i in range(24) { s = s + s }\nlen(s)", &b)
            .await
            .unwrap_err();
        assert!(matches!(&err, SandboxError::Runtime { line: 2, .. }));
        assert!(err.to_string().contains("too large"));

        let err = execute("o = [1]\nfor i in range(40) { o = [o, o] }", &b)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("too large"));
    }

    #[tokio::test]
    async fn test_bare_final_answer_is_not_a_signal() {
        let b = binding();
        let err = execute("final_answer(1)", &b).await.unwrap_err();
        assert!(err.to_string().contains("tools.final_answer"));
    }
}
