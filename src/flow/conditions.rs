use serde_json::Value;
use tracing::debug;

use crate::config::ConditionConfig;
use crate::flow::constants::context_keys;
use crate::runtime::InboundEvent;
use crate::template::coerce::{compare_numeric, loosely_equal};
use crate::template::{is_template, RenderScope, Renderer};

/// 数值比较运算符
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
}

impl Comparison {
    fn apply(self, lhs: f64, rhs: f64) -> bool {
        match self {
            Comparison::LessThan => lhs < rhs,
            Comparison::LessThanOrEqual => lhs <= rhs,
            Comparison::GreaterThan => lhs > rhs,
            Comparison::GreaterThanOrEqual => lhs >= rhs,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Comparison::LessThan => "variable_less_than",
            Comparison::LessThanOrEqual => "variable_less_than_or_equal",
            Comparison::GreaterThan => "variable_greater_than",
            Comparison::GreaterThanOrEqual => "variable_greater_than_or_equal",
        }
    }
}

/// 加载后的类型化转移条件
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Always,
    Exists(String),
    NotExists(String),
    Equals { path: String, value: Value },
    Compare {
        path: String,
        op: Comparison,
        rhs: Value,
    },
    ReplyIdEquals(String),
    Keyword {
        keyword: String,
        case_sensitive: bool,
    },
    /// 已转为小写
    ContainsAny(Vec<String>),
    FormResponseReceived,
    MessageTypeIs(String),
}

impl From<ConditionConfig> for Condition {
    fn from(config: ConditionConfig) -> Self {
        let compare = |op, c: crate::config::NumericComparisonConfig| Condition::Compare {
            path: c.variable_name,
            op,
            rhs: c.value_template,
        };
        match config {
            ConditionConfig::AlwaysTrue => Condition::Always,
            ConditionConfig::VariableExists { variable_name } => Condition::Exists(variable_name),
            ConditionConfig::VariableNotExists { variable_name } => {
                Condition::NotExists(variable_name)
            }
            ConditionConfig::VariableEquals {
                variable_name,
                value,
            } => Condition::Equals {
                path: variable_name,
                value,
            },
            ConditionConfig::VariableLessThan(c) => compare(Comparison::LessThan, c),
            ConditionConfig::VariableLessThanOrEqual(c) => compare(Comparison::LessThanOrEqual, c),
            ConditionConfig::VariableGreaterThan(c) => compare(Comparison::GreaterThan, c),
            ConditionConfig::VariableGreaterThanOrEqual(c) => {
                compare(Comparison::GreaterThanOrEqual, c)
            }
            ConditionConfig::InteractiveReplyIdEquals { value } => Condition::ReplyIdEquals(value),
            ConditionConfig::UserReplyMatchesKeyword {
                keyword,
                case_sensitive,
            } => Condition::Keyword {
                keyword,
                case_sensitive,
            },
            ConditionConfig::TextContainsAny { values } => Condition::ContainsAny(
                values.into_iter().map(|value| value.to_lowercase()).collect(),
            ),
            ConditionConfig::FormResponseReceived => Condition::FormResponseReceived,
            ConditionConfig::MessageTypeIs { message_type } => {
                Condition::MessageTypeIs(message_type.to_lowercase())
            }
        }
    }
}

impl Condition {
    /// 条件读取的上下文路径
    pub fn read_path(&self) -> Option<&str> {
        match self {
            Condition::Exists(path)
            | Condition::NotExists(path)
            | Condition::Equals { path, .. }
            | Condition::Compare { path, .. } => Some(path),
            Condition::FormResponseReceived => Some(context_keys::FORM_RESPONSE_RECEIVED),
            _ => None,
        }
    }

    /// 条件中出现的模板
    pub fn templates(&self) -> Vec<&str> {
        match self {
            Condition::Equals {
                value: Value::String(raw),
                ..
            }
            | Condition::Compare {
                rhs: Value::String(raw),
                ..
            } if is_template(raw) => vec![raw.as_str()],
            _ => Vec::new(),
        }
    }

    /// `variable_exists` 一类仅检查存在性的条件
    pub fn is_existence_check(&self) -> bool {
        matches!(self, Condition::Exists(_) | Condition::NotExists(_))
    }
}

/// 条件求值器：纯函数，无副作用
pub struct ConditionEvaluator<'r> {
    renderer: &'r Renderer,
}

impl<'r> ConditionEvaluator<'r> {
    pub fn new(renderer: &'r Renderer) -> Self {
        Self { renderer }
    }

    pub fn evaluate(
        &self,
        condition: &Condition,
        scope: &RenderScope<'_>,
        event: Option<&InboundEvent>,
    ) -> bool {
        let context = scope.context();
        match condition {
            Condition::Always => true,
            Condition::Exists(path) => context.contains_path(path),
            Condition::NotExists(path) => !context.contains_path(path),
            Condition::Equals { path, value } => {
                let Some(actual) = context.lookup(path) else {
                    return value.is_null();
                };
                match self.operand(value, scope) {
                    Some(expected) => loosely_equal(actual, &expected),
                    None => false,
                }
            }
            Condition::Compare { path, op, rhs } => self.compare(path, *op, rhs, scope),
            Condition::ReplyIdEquals(expected) => {
                event.and_then(InboundEvent::reply_id) == Some(expected.as_str())
            }
            Condition::Keyword {
                keyword,
                case_sensitive,
            } => match event.and_then(InboundEvent::text_body) {
                Some(text) if *case_sensitive => text.trim() == keyword.trim(),
                Some(text) => text.trim().eq_ignore_ascii_case(keyword.trim()),
                None => false,
            },
            Condition::ContainsAny(values) => match event.and_then(InboundEvent::text_body) {
                Some(text) => {
                    let text = text.to_lowercase();
                    values.iter().any(|value| text.contains(value.as_str()))
                }
                None => false,
            },
            Condition::FormResponseReceived => context
                .lookup(context_keys::FORM_RESPONSE_RECEIVED)
                .map(|flag| loosely_equal(flag, &Value::Bool(true)))
                .unwrap_or(false),
            Condition::MessageTypeIs(expected) => match event {
                Some(event) => {
                    event.kind().as_str() == expected
                        || event
                            .mime_type()
                            .and_then(|mime| mime.split('/').next())
                            .map(|family| family.eq_ignore_ascii_case(expected))
                            .unwrap_or(false)
                }
                None => false,
            },
        }
    }

    fn compare(&self, path: &str, op: Comparison, rhs: &Value, scope: &RenderScope<'_>) -> bool {
        let Some(lhs) = scope.context().lookup(path) else {
            debug!(condition = op.as_str(), path, "numeric condition on missing variable");
            return false;
        };
        let Some(rhs) = self.operand(rhs, scope) else {
            return false;
        };
        match compare_numeric(lhs, &rhs, |a, b| op.apply(a, b)) {
            Some(result) => result,
            None => {
                debug!(
                    condition = op.as_str(),
                    path,
                    lhs = %lhs,
                    rhs = %rhs,
                    "numeric coercion failed, condition is false"
                );
                false
            }
        }
    }

    /// 右侧操作数：模板字符串先解析
    fn operand(&self, raw: &Value, scope: &RenderScope<'_>) -> Option<Value> {
        match raw {
            Value::String(text) if is_template(text) => match self.renderer.resolve(raw, scope) {
                Ok(value) => Some(value),
                Err(err) => {
                    debug!(template = %text, error = %err, "condition operand failed to render");
                    None
                }
            },
            other => Some(other.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::FlowContext;
    use serde_json::json;

    fn context(value: Value) -> FlowContext {
        FlowContext::from_map(value.as_object().cloned().unwrap_or_default())
    }

    fn check(condition: ConditionConfig, ctx: &FlowContext, event: Option<&InboundEvent>) -> bool {
        let renderer = Renderer::new();
        ConditionEvaluator::new(&renderer).evaluate(&condition.into(), &RenderScope::new(ctx), event)
    }

    fn cond(value: Value) -> ConditionConfig {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn exists_is_not_truthiness() {
        let ctx = context(json!({"zero": 0, "no": false, "empty": ""}));
        for path in ["zero", "no", "empty"] {
            assert!(check(cond(json!({"type": "variable_exists", "variable_name": path})), &ctx, None));
        }
        assert!(!check(cond(json!({"type": "variable_exists", "variable_name": "missing"})), &ctx, None));
        assert!(check(cond(json!({"type": "variable_not_exists", "variable_name": "missing"})), &ctx, None));
    }

    #[test]
    fn equals_compares_loosely() {
        let ctx = context(json!({"has_booking_ref": "true", "found": []}));
        assert!(check(
            cond(json!({"type": "variable_equals", "variable_name": "has_booking_ref", "value": "true"})),
            &ctx,
            None
        ));
        assert!(check(
            cond(json!({"type": "variable_equals", "variable_name": "found", "value": "[]"})),
            &ctx,
            None
        ));
    }

    #[test]
    fn string_numbers_are_coerced() {
        let ctx = context(json!({"count": "5", "bound": 10}));
        assert!(check(
            cond(json!({"type": "variable_less_than", "variable_name": "count", "value_template": "{{ bound }}"})),
            &ctx,
            None
        ));
    }

    fn loop_condition() -> ConditionConfig {
        cond(json!({
            "type": "variable_less_than_or_equal",
            "variable_name": "traveler_index",
            "value_template": "{{ bound }}"
        }))
    }

    #[test]
    fn counter_loop_stops_one_past_the_bound() {
        for bound in [2u32, 10, 22] {
            for idx in 1..=bound {
                let ctx = context(json!({"traveler_index": idx, "bound": bound}));
                assert!(check(loop_condition(), &ctx, None), "idx {} bound {}", idx, bound);
            }
            let ctx = context(json!({"traveler_index": bound + 1, "bound": bound}));
            assert!(!check(loop_condition(), &ctx, None), "idx {} bound {}", bound + 1, bound);
        }
    }

    #[test]
    fn unparseable_numbers_fail_closed() {
        let ctx = context(json!({"count": "not_a_number", "rhs": 10}));
        for kind in [
            "variable_less_than",
            "variable_less_than_or_equal",
            "variable_greater_than",
            "variable_greater_than_or_equal",
        ] {
            let condition =
                cond(json!({"type": kind, "variable_name": "count", "value_template": "{{ rhs }}"}));
            assert!(!check(condition, &ctx, None), "{}", kind);
            // 右侧无法转换同样为 false
            let reversed =
                cond(json!({"type": kind, "variable_name": "rhs", "value_template": "{{ count }}"}));
            assert!(!check(reversed, &ctx, None), "{} reversed", kind);
        }
    }

    #[test]
    fn keyword_and_reply_conditions_read_the_event() {
        let ctx = FlowContext::new();
        let text = InboundEvent::text("c1", "  Menu ");
        let reply = InboundEvent::reply("c1", "book_tour");
        assert!(check(cond(json!({"type": "user_reply_matches_keyword", "keyword": "menu"})), &ctx, Some(&text)));
        assert!(!check(cond(json!({"type": "user_reply_matches_keyword", "keyword": "menu", "case_sensitive": true})), &ctx, Some(&text)));
        assert!(check(cond(json!({"type": "interactive_reply_id_equals", "value": "book_tour"})), &ctx, Some(&reply)));
        assert!(!check(cond(json!({"type": "interactive_reply_id_equals", "value": "book_tour"})), &ctx, Some(&text)));
        assert!(check(cond(json!({"type": "text_contains_any", "values": ["MENU", "home"]})), &ctx, Some(&text)));
    }

    #[test]
    fn message_type_matches_kind_or_mime_family() {
        let ctx = FlowContext::new();
        let upload = InboundEvent::media("c1", "m1", Some("image/jpeg"));
        assert!(check(cond(json!({"type": "message_type_is", "message_type": "media"})), &ctx, Some(&upload)));
        assert!(check(cond(json!({"type": "message_type_is", "message_type": "image"})), &ctx, Some(&upload)));
        assert!(!check(cond(json!({"type": "message_type_is", "message_type": "text"})), &ctx, Some(&upload)));
    }
}
