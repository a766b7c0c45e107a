//! 解释器：在 Binding 的变量快照上执行语句树
//!
//! 只在工作副本上写变量，执行成功后把新增/修改的用户变量交给调用方合并；
//! `tools.final_answer(x)` 通过 Interrupt::Final 非本地退出，普通值无法伪造。
//! 工具调用是 async 的（可能是网络 I/O 或子智能体），所以整棵求值树用 BoxFuture 递归。

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;

use futures_util::future::{BoxFuture, FutureExt};
use serde_json::{Map, Value};

use crate::sandbox::parser::{BinOp, Expr, ExprKind, Namespace, Stmt, UnOp};
use crate::sandbox::value::{
    arith, check_len, compare, float_value, render_value, truthy, type_name, values_equal, Num,
};
use crate::sandbox::{Binding, Execution, SandboxError};
use crate::tools::FINAL_ANSWER_TOOL;

/// 一次执行内所有循环的总迭代上限
const MAX_ITERATIONS: usize = 10_000;

/// 求值被打断：给出最终答案，或出错
pub(crate) enum Interrupt {
    Final(Value),
    Fault(SandboxError),
}

impl From<SandboxError> for Interrupt {
    fn from(err: SandboxError) -> Self {
        Interrupt::Fault(err)
    }
}

type Eval<'a> = BoxFuture<'a, Result<Value, Interrupt>>;

fn runtime(line: usize, message: impl Into<String>) -> Interrupt {
    Interrupt::Fault(SandboxError::Runtime {
        line,
        message: message.into(),
    })
}

pub(crate) struct Interpreter<'b> {
    binding: &'b Binding,
    vars: BTreeMap<String, Value>,
    assigned: BTreeMap<String, Value>,
    logs: Vec<String>,
    iterations: usize,
}

impl<'b> Interpreter<'b> {
    pub(crate) fn new(binding: &'b Binding) -> Self {
        Self {
            binding,
            vars: binding.variables().clone(),
            assigned: BTreeMap::new(),
            logs: Vec::new(),
            iterations: 0,
        }
    }

    pub(crate) async fn run(mut self, program: &[Stmt]) -> Result<Execution, SandboxError> {
        match self.exec_block(program).await {
            Ok(value) => Ok(Execution {
                value,
                assigned: self.assigned,
                final_answer: None,
                logs: self.logs,
            }),
            Err(Interrupt::Final(answer)) => Ok(Execution {
                value: answer.clone(),
                assigned: self.assigned,
                final_answer: Some(answer),
                logs: self.logs,
            }),
            Err(Interrupt::Fault(err)) => Err(err),
        }
    }

    fn assign(&mut self, name: &str, value: Value) {
        self.vars.insert(name.to_string(), value.clone());
        self.assigned.insert(name.to_string(), value);
    }

    fn exec_block<'a>(&'a mut self, stmts: &'a [Stmt]) -> Eval<'a> {
        async move {
            let mut last = Value::Null;
            for stmt in stmts {
                last = self.exec_stmt(stmt).await?;
            }
            Ok(last)
        }
        .boxed()
    }

    fn exec_stmt<'a>(&'a mut self, stmt: &'a Stmt) -> Eval<'a> {
        async move {
            match stmt {
                Stmt::Assign { name, value, .. } => {
                    let v = self.eval(value).await?;
                    self.assign(name, v.clone());
                    Ok(v)
                }
                Stmt::If {
                    cond,
                    then,
                    otherwise,
                } => {
                    let c = self.eval(cond).await?;
                    if truthy(&c) {
                        self.exec_block(then).await
                    } else {
                        self.exec_block(otherwise).await
                    }
                }
                Stmt::For {
                    var,
                    iter,
                    body,
                    line,
                } => {
                    let items = match self.eval(iter).await? {
                        Value::Array(items) => items,
                        Value::Object(map) => map.into_iter().map(|(k, _)| Value::String(k)).collect(),
                        Value::String(s) => s.chars().map(|c| Value::String(c.to_string())).collect(),
                        other => {
                            return Err(runtime(
                                *line,
                                format!("cannot iterate over {}", type_name(&other)),
                            ))
                        }
                    };
                    let mut last = Value::Null;
                    for item in items {
                        self.iterations += 1;
                        if self.iterations > MAX_ITERATIONS {
                            return Err(runtime(
                                *line,
                                format!("loop limit of {MAX_ITERATIONS} iterations exceeded"),
                            ));
                        }
                        self.assign(var, item);
                        last = self.exec_block(body).await?;
                    }
                    Ok(last)
                }
                Stmt::Expr(expr) => self.eval(expr).await,
            }
        }
        .boxed()
    }

    fn eval<'a>(&'a mut self, expr: &'a Expr) -> Eval<'a> {
        async move {
            let line = expr.line;
            match &expr.kind {
                ExprKind::Literal(v) => Ok(v.clone()),
                ExprKind::Var(name) => self.vars.get(name).cloned().ok_or_else(|| {
                    let hint = if self.binding.tools().contains(name) {
                        format!("; did you mean tools.{name}(...)?")
                    } else if self.binding.agents().contains(name) {
                        format!("; did you mean agents.{name}(...)?")
                    } else {
                        String::new()
                    };
                    runtime(line, format!("name '{name}' is not defined{hint}"))
                }),
                ExprKind::Array(items) => {
                    let mut out = Vec::with_capacity(items.len());
                    for item in items {
                        out.push(self.eval(item).await?);
                    }
                    check_len(Value::Array(out)).map_err(|e| runtime(line, e))
                }
                ExprKind::Object(entries) => {
                    let mut map = Map::new();
                    for (key, value) in entries {
                        let v = self.eval(value).await?;
                        map.insert(key.clone(), v);
                    }
                    check_len(Value::Object(map)).map_err(|e| runtime(line, e))
                }
                ExprKind::Unary(op, operand) => {
                    let v = self.eval(operand).await?;
                    match op {
                        UnOp::Not => Ok(Value::Bool(!truthy(&v))),
                        UnOp::Neg => match Num::of(&v) {
                            Some(Num::Int(i)) => i
                                .checked_neg()
                                .map(Value::from)
                                .ok_or_else(|| runtime(line, "integer overflow")),
                            Some(Num::Float(f)) => float_value(-f).map_err(|e| runtime(line, e)),
                            None => Err(runtime(
                                line,
                                format!("bad operand type for unary -: {}", type_name(&v)),
                            )),
                        },
                    }
                }
                ExprKind::And(lhs, rhs) => {
                    let l = self.eval(lhs).await?;
                    if !truthy(&l) {
                        return Ok(Value::Bool(false));
                    }
                    let r = self.eval(rhs).await?;
                    Ok(Value::Bool(truthy(&r)))
                }
                ExprKind::Or(lhs, rhs) => {
                    let l = self.eval(lhs).await?;
                    if truthy(&l) {
                        return Ok(Value::Bool(true));
                    }
                    let r = self.eval(rhs).await?;
                    Ok(Value::Bool(truthy(&r)))
                }
                ExprKind::Binary(op, lhs, rhs) => {
                    let l = self.eval(lhs).await?;
                    let r = self.eval(rhs).await?;
                    binary(*op, &l, &r).map_err(|e| runtime(line, e))
                }
                ExprKind::Index(target, index) => {
                    let t = self.eval(target).await?;
                    let i = self.eval(index).await?;
                    index_value(&t, &i).map_err(|e| runtime(line, e))
                }
                ExprKind::Field(target, field) => {
                    let t = self.eval(target).await?;
                    match &t {
                        Value::Object(map) => map
                            .get(field)
                            .cloned()
                            .ok_or_else(|| runtime(line, format!("object has no field '{field}'"))),
                        other => Err(runtime(
                            line,
                            format!("cannot read field '{field}' of {}", type_name(other)),
                        )),
                    }
                }
                ExprKind::Call(name, args) => {
                    let values = self.eval_args(args).await?;
                    self.builtin(name, values, line)
                }
                ExprKind::External { ns, name, args } => {
                    let values = self.eval_args(args).await?;
                    self.call_external(*ns, name, values, line).await
                }
            }
        }
        .boxed()
    }

    async fn eval_args(&mut self, args: &[Expr]) -> Result<Vec<Value>, Interrupt> {
        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            values.push(self.eval(arg).await?);
        }
        Ok(values)
    }

    async fn call_external(
        &mut self,
        ns: Namespace,
        name: &str,
        args: Vec<Value>,
        line: usize,
    ) -> Result<Value, Interrupt> {
        if ns == Namespace::Tools && name == FINAL_ANSWER_TOOL {
            let mut args = args;
            if args.len() != 1 {
                return Err(runtime(
                    line,
                    format!("tools.final_answer expects 1 argument, got {}", args.len()),
                ));
            }
            return Err(Interrupt::Final(args.remove(0)));
        }
        let table = match ns {
            Namespace::Tools => self.binding.tools(),
            Namespace::Agents => self.binding.agents(),
        };
        let Some(tool) = table.get(name) else {
            let available = table.tool_names();
            return Err(runtime(
                line,
                format!(
                    "unknown {} '{name}'; available: [{}]",
                    ns.as_str(),
                    available.join(", ")
                ),
            ));
        };
        let called = AssertUnwindSafe(tool.call(args)).catch_unwind().await;
        match called {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(message)) => Err(Interrupt::Fault(SandboxError::Tool {
                name: format!("{}.{name}", ns.as_str()),
                message,
            })),
            Err(_) => Err(Interrupt::Fault(SandboxError::Tool {
                name: format!("{}.{name}", ns.as_str()),
                message: "tool panicked".to_string(),
            })),
        }
    }

    fn builtin(&mut self, name: &str, args: Vec<Value>, line: usize) -> Result<Value, Interrupt> {
        let arity = |n: usize| -> Result<(), Interrupt> {
            if args.len() == n {
                Ok(())
            } else {
                Err(runtime(
                    line,
                    format!("{name}() takes {n} argument(s), got {}", args.len()),
                ))
            }
        };
        let err = |e: String| runtime(line, e);
        match name {
            "print" => {
                let text: Vec<String> = args.iter().map(render_value).collect();
                self.logs.push(text.join(" "));
                Ok(Value::Null)
            }
            "len" => {
                arity(1)?;
                let n = match &args[0] {
                    Value::String(s) => s.chars().count(),
                    Value::Array(a) => a.len(),
                    Value::Object(o) => o.len(),
                    other => return Err(err(format!("{} has no len()", type_name(other)))),
                };
                Ok(Value::from(n as u64))
            }
            "str" => {
                arity(1)?;
                Ok(Value::String(render_value(&args[0])))
            }
            "int" => {
                arity(1)?;
                let n = match &args[0] {
                    Value::String(s) => {
                        let s = s.trim();
                        s.parse::<i64>()
                            .or_else(|_| s.parse::<f64>().map(|f| f.trunc() as i64))
                            .map_err(|_| err(format!("invalid literal for int(): '{s}'")))?
                    }
                    Value::Bool(b) => i64::from(*b),
                    other => match Num::of(other) {
                        Some(Num::Int(i)) => i,
                        Some(Num::Float(f)) => f.trunc() as i64,
                        None => return Err(err(format!("int() argument must be a number or string, not {}", type_name(other)))),
                    },
                };
                Ok(Value::from(n))
            }
            "float" => {
                arity(1)?;
                let f = match &args[0] {
                    Value::String(s) => s
                        .trim()
                        .parse::<f64>()
                        .map_err(|_| err(format!("invalid literal for float(): '{s}'")))?,
                    other => Num::of(other)
                        .map(Num::as_f64)
                        .ok_or_else(|| err(format!("float() argument must be a number or string, not {}", type_name(other))))?,
                };
                float_value(f).map_err(err)
            }
            "round" => {
                if args.is_empty() || args.len() > 2 {
                    return Err(err(format!("round() takes 1 or 2 arguments, got {}", args.len())));
                }
                let x = Num::of(&args[0])
                    .ok_or_else(|| err(format!("round() needs a number, not {}", type_name(&args[0]))))?;
                let digits = match args.get(1) {
                    None => 0,
                    Some(d) => match Num::of(d) {
                        Some(Num::Int(i)) if (0..=15).contains(&i) => i as i32,
                        _ => return Err(err("round() digits must be an integer in 0..=15".to_string())),
                    },
                };
                match x {
                    Num::Int(i) => Ok(Value::from(i)),
                    Num::Float(f) if digits == 0 => Ok(Value::from(f.round() as i64)),
                    Num::Float(f) => {
                        let scale = 10f64.powi(digits);
                        float_value((f * scale).round() / scale).map_err(err)
                    }
                }
            }
            "abs" => {
                arity(1)?;
                match Num::of(&args[0]) {
                    Some(Num::Int(i)) => i
                        .checked_abs()
                        .map(Value::from)
                        .ok_or_else(|| err("integer overflow".to_string())),
                    Some(Num::Float(f)) => float_value(f.abs()).map_err(err),
                    None => Err(err(format!("abs() needs a number, not {}", type_name(&args[0])))),
                }
            }
            "min" | "max" | "sum" => {
                let items = match args.as_slice() {
                    [Value::Array(items)] => items.clone(),
                    _ if name == "sum" => return Err(err("sum() takes one array".to_string())),
                    _ => args.clone(),
                };
                if name == "sum" {
                    let mut total = Value::from(0);
                    for item in &items {
                        total = arith(crate::sandbox::value::ArithOp::Add, &total, item).map_err(err)?;
                    }
                    return Ok(total);
                }
                let mut best: Option<Value> = None;
                for item in items {
                    best = Some(match best {
                        None => item,
                        Some(current) => {
                            let ord = compare(&item, &current).map_err(err)?;
                            let better = if name == "min" { ord.is_lt() } else { ord.is_gt() };
                            if better {
                                item
                            } else {
                                current
                            }
                        }
                    });
                }
                best.ok_or_else(|| err(format!("{name}() of empty sequence")))
            }
            "range" => {
                let bounds: Vec<i64> = args
                    .iter()
                    .map(|a| match Num::of(a) {
                        Some(Num::Int(i)) => Ok(i),
                        _ => Err(err("range() arguments must be integers".to_string())),
                    })
                    .collect::<Result<_, _>>()?;
                let (start, end) = match bounds.as_slice() {
                    [end] => (0, *end),
                    [start, end] => (*start, *end),
                    _ => return Err(err("range() takes 1 or 2 arguments".to_string())),
                };
                let count = end.saturating_sub(start).max(0) as usize;
                if count > MAX_ITERATIONS {
                    return Err(err(format!("range() larger than {MAX_ITERATIONS}")));
                }
                Ok(Value::Array((start..end).map(Value::from).collect()))
            }
            other => {
                let hint = if self.binding.tools().contains(other) {
                    format!("; tools are called as tools.{other}(...)")
                } else if self.binding.agents().contains(other) {
                    format!("; agents are called as agents.{other}(...)")
                } else if other == FINAL_ANSWER_TOOL {
                    "; use tools.final_answer(...)".to_string()
                } else {
                    String::new()
                };
                Err(err(format!("unknown function '{other}'{hint}")))
            }
        }
    }
}

fn binary(op: BinOp, l: &Value, r: &Value) -> Result<Value, String> {
    Ok(match op {
        BinOp::Arith(a) => return arith(a, l, r),
        BinOp::Eq => Value::Bool(values_equal(l, r)),
        BinOp::NotEq => Value::Bool(!values_equal(l, r)),
        BinOp::Lt => Value::Bool(compare(l, r)?.is_lt()),
        BinOp::Le => Value::Bool(compare(l, r)?.is_le()),
        BinOp::Gt => Value::Bool(compare(l, r)?.is_gt()),
        BinOp::Ge => Value::Bool(compare(l, r)?.is_ge()),
    })
}

fn index_value(target: &Value, index: &Value) -> Result<Value, String> {
    match (target, index) {
        (Value::Object(map), Value::String(key)) => map
            .get(key)
            .cloned()
            .ok_or_else(|| format!("key '{key}' not found")),
        (Value::Array(items), idx) => {
            let i = position(idx, items.len())?;
            Ok(items[i].clone())
        }
        (Value::String(s), idx) => {
            let chars: Vec<char> = s.chars().collect();
            let i = position(idx, chars.len())?;
            Ok(Value::String(chars[i].to_string()))
        }
        (t, i) => Err(format!("cannot index {} with {}", type_name(t), type_name(i))),
    }
}

/// 下标支持负数（从末尾计）
fn position(idx: &Value, len: usize) -> Result<usize, String> {
    let Some(Num::Int(i)) = Num::of(idx) else {
        return Err(format!("index must be an integer, not {}", type_name(idx)));
    };
    let resolved = if i < 0 { len as i64 + i } else { i };
    if resolved < 0 || resolved >= len as i64 {
        return Err(format!("index {i} out of range for length {len}"));
    }
    Ok(resolved as usize)
}
