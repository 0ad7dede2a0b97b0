use serde_json::Value;

/// 将 Value 转换为 f64；字符串会先去除首尾空白再解析
pub fn to_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

/// 数值比较，任一侧无法转换时返回 None
pub fn compare_numeric<F>(value: &Value, target: &Value, compare_fn: F) -> Option<bool>
where
    F: Fn(f64, f64) -> bool,
{
    let a = to_f64(value)?;
    let b = to_f64(target)?;
    Some(compare_fn(a, b))
}

/// 将 Value 转换为展示用字符串
pub fn to_display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// 宽松相等：JSON 相等或展示字符串相等（`"5"` 与 `5`、`"[]"` 与 `[]`）
pub fn loosely_equal(left: &Value, right: &Value) -> bool {
    if left == right {
        return true;
    }
    if let (Some(a), Some(b)) = (left.as_f64(), right.as_f64()) {
        return a == b;
    }
    to_display(left) == to_display(right)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_to_f64() {
        assert_eq!(to_f64(&json!(42)), Some(42.0));
        assert_eq!(to_f64(&json!(" 5 ")), Some(5.0));
        assert_eq!(to_f64(&json!(true)), Some(1.0));
        assert_eq!(to_f64(&json!(null)), None);
        assert_eq!(to_f64(&json!("not_a_number")), None);
        assert_eq!(to_f64(&json!("")), None);
        assert_eq!(to_f64(&json!([1, 2])), None);
    }

    #[test]
    fn test_compare_numeric() {
        assert_eq!(compare_numeric(&json!("10"), &json!(5), |a, b| a > b), Some(true));
        assert_eq!(compare_numeric(&json!("x"), &json!(5), |a, b| a > b), None);
    }

    #[test]
    fn test_loosely_equal() {
        assert!(loosely_equal(&json!([]), &json!("[]")));
        assert!(loosely_equal(&json!(true), &json!("true")));
        assert!(loosely_equal(&json!(2), &json!(2.0)));
        assert!(loosely_equal(&json!("5"), &json!(5)));
        assert!(!loosely_equal(&json!("yes"), &json!("no")));
    }
}
