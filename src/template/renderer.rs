use std::borrow::Cow;
use std::collections::HashSet;

use minijinja::{Environment, UndefinedBehavior};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

use super::helpers;
use crate::error::Result;
use crate::flow::constants::context_keys;
use crate::state::FlowContext;

/// 渲染作用域：联系人上下文 + 引擎注入的根变量（`contact`、`message`）
#[derive(Debug, Clone)]
pub struct RenderScope<'a> {
    context: &'a FlowContext,
    contact: Option<Value>,
    message: Option<Value>,
}

impl<'a> RenderScope<'a> {
    pub fn new(context: &'a FlowContext) -> Self {
        Self {
            context,
            contact: None,
            message: None,
        }
    }

    pub fn with_contact(mut self, id: &str, name: Option<&str>) -> Self {
        self.contact = Some(serde_json::json!({ "id": id, "name": name.unwrap_or_default() }));
        self
    }

    pub fn with_message(mut self, message: Value) -> Self {
        self.message = Some(message);
        self
    }

    pub fn context(&self) -> &FlowContext {
        self.context
    }

    fn to_value(&self) -> minijinja::Value {
        let mut root: Map<String, Value> = self.context.as_map().clone();
        if let Some(contact) = &self.contact {
            root.insert(context_keys::SCOPE_CONTACT.to_string(), contact.clone());
        }
        if let Some(message) = &self.message {
            root.insert(context_keys::SCOPE_MESSAGE.to_string(), message.clone());
        }
        minijinja::Value::from_serialize(&root)
    }
}

/// 表达式渲染器 - 封装 Minijinja
///
/// 引用缺失路径（含嵌套路径）时渲染为空字符串而不是报错。
pub struct Renderer {
    env: Environment<'static>,
}

impl Renderer {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Chainable);
        env.set_keep_trailing_newline(true);
        helpers::register(&mut env);
        Self { env }
    }

    /// 渲染模板字符串
    pub fn render(&self, template: &str, scope: &RenderScope<'_>) -> Result<String> {
        if !is_template(template) {
            return Ok(template.to_string());
        }
        let source = index_paths(template);
        let tmpl = self.env.template_from_str(&source)?;
        Ok(tmpl.render(scope.to_value())?)
    }

    /// 求值表达式，保留类型（数字、列表、布尔）；允许带 `{{ }}` 包裹
    ///
    /// 未定义的结果返回 `Value::Null`。
    pub fn evaluate(&self, expr: &str, scope: &RenderScope<'_>) -> Result<Value> {
        let source = index_paths(single_expression(expr).unwrap_or(expr));
        let expression = self.env.compile_expression(&source)?;
        let value = expression.eval(scope.to_value())?;
        Ok(to_json(value))
    }

    /// 递归解析参数：单表达式字符串按类型求值，其余模板字符串渲染为文本
    pub fn resolve(&self, value: &Value, scope: &RenderScope<'_>) -> Result<Value> {
        match value {
            Value::String(raw) => {
                if let Some(expr) = single_expression(raw) {
                    self.evaluate(expr, scope)
                } else if is_template(raw) {
                    Ok(Value::String(self.render(raw, scope)?))
                } else {
                    Ok(value.clone())
                }
            }
            Value::Array(items) => items
                .iter()
                .map(|item| self.resolve(item, scope))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            Value::Object(map) => {
                let mut resolved = Map::with_capacity(map.len());
                for (key, item) in map {
                    resolved.insert(key.clone(), self.resolve(item, scope)?);
                }
                Ok(Value::Object(resolved))
            }
            other => Ok(other.clone()),
        }
    }

    /// 仅检查语法
    pub fn check(&self, template: &str) -> Result<()> {
        if let Some(expr) = single_expression(template) {
            self.env.compile_expression(&index_paths(expr))?;
        } else if is_template(template) {
            self.env.template_from_str(&index_paths(template))?;
        }
        Ok(())
    }

    /// 模板引用的根变量名（不含循环变量等模板内部定义）
    pub fn referenced_roots(&self, template: &str) -> Result<HashSet<String>> {
        if !is_template(template) {
            return Ok(HashSet::new());
        }
        let source = index_paths(template);
        let tmpl = self.env.template_from_str(&source)?;
        let mut roots = tmpl.undeclared_variables(false);
        roots.retain(|name| !helpers::GLOBAL_FUNCTIONS.contains(&name.as_str()));
        Ok(roots)
    }
}

impl Default for Renderer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Renderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Renderer").finish_non_exhaustive()
    }
}

pub fn is_template(raw: &str) -> bool {
    raw.contains("{{") || raw.contains("{%")
}

/// `"{{ expr }}"` -> `Some("expr")`；混合文本或多个表达式返回 None
fn single_expression(raw: &str) -> Option<&str> {
    let inner = raw.trim().strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") || inner.contains("{%") {
        return None;
    }
    let inner = inner.trim_start_matches('-').trim_end_matches('-').trim();
    (!inner.is_empty()).then_some(inner)
}

static DOTTED_INDEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"([A-Za-z_][A-Za-z0-9_]*|\])\.([0-9]+)\b").unwrap_or_else(|_| unreachable!())
});

/// `found_booking.0.tour_name` -> `found_booking[0].tour_name`
fn index_paths(source: &str) -> Cow<'_, str> {
    let mut out = Cow::Borrowed(source);
    while DOTTED_INDEX.is_match(&out) {
        let replaced = DOTTED_INDEX.replace_all(&out, "$1[$2]").into_owned();
        out = Cow::Owned(replaced);
    }
    out
}

fn to_json(value: minijinja::Value) -> Value {
    if value.is_undefined() || value.is_none() {
        return Value::Null;
    }
    serde_json::to_value(&value).unwrap_or(Value::Null)
}
