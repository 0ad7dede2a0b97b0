use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 结构化的转移条件定义
///
/// 以 `type` 字段区分，未知类型在加载时直接报错。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConditionConfig {
    AlwaysTrue,
    VariableExists {
        #[serde(alias = "path")]
        variable_name: String,
    },
    VariableNotExists {
        #[serde(alias = "path")]
        variable_name: String,
    },
    VariableEquals {
        #[serde(alias = "path")]
        variable_name: String,
        value: Value,
    },
    VariableLessThan(NumericComparisonConfig),
    VariableLessThanOrEqual(NumericComparisonConfig),
    VariableGreaterThan(NumericComparisonConfig),
    VariableGreaterThanOrEqual(NumericComparisonConfig),
    InteractiveReplyIdEquals {
        value: String,
    },
    UserReplyMatchesKeyword {
        keyword: String,
        #[serde(default)]
        case_sensitive: bool,
    },
    TextContainsAny {
        values: Vec<String>,
    },
    #[serde(alias = "whatsapp_flow_response_received")]
    FormResponseReceived,
    MessageTypeIs {
        message_type: String,
    },
}

impl Default for ConditionConfig {
    fn default() -> Self {
        ConditionConfig::AlwaysTrue
    }
}

/// 数值比较：左侧为上下文路径，右侧为模板或字面量
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumericComparisonConfig {
    #[serde(alias = "path")]
    pub variable_name: String,
    #[serde(alias = "value")]
    pub value_template: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_numeric_comparison_with_template() {
        let parsed: ConditionConfig = serde_json::from_value(json!({
            "type": "variable_less_than_or_equal",
            "variable_name": "traveler_index",
            "value_template": "{{ num_travelers }}"
        }))
        .unwrap();
        assert_eq!(
            parsed,
            ConditionConfig::VariableLessThanOrEqual(NumericComparisonConfig {
                variable_name: "traveler_index".into(),
                value_template: json!("{{ num_travelers }}"),
            })
        );
    }

    #[test]
    fn legacy_form_condition_alias() {
        let parsed: ConditionConfig =
            serde_json::from_value(json!({"type": "whatsapp_flow_response_received"})).unwrap();
        assert_eq!(parsed, ConditionConfig::FormResponseReceived);
    }

    #[test]
    fn unknown_condition_type_is_rejected() {
        let parsed: Result<ConditionConfig, _> =
            serde_json::from_value(json!({"type": "timeout_or_missing_data"}));
        assert!(parsed.is_err());
    }
}
