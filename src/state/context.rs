use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 联系人上下文
///
/// 无 schema 的键值映射，同时保存引擎簿记信息（以 `_` 开头的键）与用户采集到的业务值。
/// 路径使用点号分隔，数字段可索引数组，例如 `found_booking.0.tour_name`。
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlowContext {
    values: Map<String, Value>,
}

impl FlowContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(values: Map<String, Value>) -> Self {
        Self { values }
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.values
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.values
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// 按点号路径查找；`null` 视为不存在
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let first = segments.next()?;
        let mut current = self.values.get(first)?;
        for segment in segments {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        if current.is_null() {
            None
        } else {
            Some(current)
        }
    }

    pub fn contains_path(&self, path: &str) -> bool {
        self.lookup(path).is_some()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.values.remove(key)
    }

    /// 写入点号路径，缺失的中间层级以对象补齐
    pub fn set_path(&mut self, path: &str, value: Value) {
        let segments: Vec<&str> = path.split('.').collect();
        let (last, parents) = match segments.split_last() {
            Some(split) => split,
            None => return,
        };
        if parents.is_empty() {
            self.values.insert((*last).to_string(), value);
            return;
        }

        let mut current = self
            .values
            .entry(parents[0].to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        for segment in &parents[1..] {
            current = descend(current, segment);
        }
        match current {
            Value::Array(items) => match last.parse::<usize>() {
                Ok(index) if index < items.len() => items[index] = value,
                Ok(index) if index == items.len() => items.push(value),
                _ => {}
            },
            other => {
                if !other.is_object() {
                    *other = Value::Object(Map::new());
                }
                if let Value::Object(map) = other {
                    map.insert((*last).to_string(), value);
                }
            }
        }
    }

    pub fn remove_path(&mut self, path: &str) -> Option<Value> {
        let (parent, last) = match path.rsplit_once('.') {
            Some(split) => split,
            None => return self.values.remove(path),
        };
        let mut segments = parent.split('.');
        let mut current = self.values.get_mut(segments.next()?)?;
        for segment in segments {
            current = match current {
                Value::Object(map) => map.get_mut(segment)?,
                Value::Array(items) => items.get_mut(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        match current {
            Value::Object(map) => map.remove(last),
            _ => None,
        }
    }

    /// 应用补丁：`null` 删除键，其余覆盖写入；带点号的键按路径处理
    pub fn apply_patch(&mut self, patch: &Map<String, Value>) {
        for (key, value) in patch {
            if value.is_null() {
                self.remove_path(key);
            } else {
                self.set_path(key, value.clone());
            }
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.values.keys()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl From<Map<String, Value>> for FlowContext {
    fn from(values: Map<String, Value>) -> Self {
        Self::from_map(values)
    }
}

fn descend<'a>(current: &'a mut Value, segment: &str) -> &'a mut Value {
    let index = match (&*current, segment.parse::<usize>()) {
        (Value::Array(items), Ok(index)) if index < items.len() => Some(index),
        _ => None,
    };
    match (index, current) {
        (Some(index), Value::Array(items)) => &mut items[index],
        (_, current) => {
            if !current.is_object() {
                *current = Value::Object(Map::new());
            }
            match current {
                Value::Object(map) => map
                    .entry(segment.to_string())
                    .or_insert_with(|| Value::Object(Map::new())),
                other => other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context(value: Value) -> FlowContext {
        match value {
            Value::Object(map) => FlowContext::from_map(map),
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn lookup_walks_objects_and_arrays() {
        let ctx = context(json!({
            "found_booking": [{"tour_name": "Victoria Falls", "amount": 0}],
            "flag": false,
            "empty": ""
        }));
        assert_eq!(
            ctx.lookup("found_booking.0.tour_name"),
            Some(&json!("Victoria Falls"))
        );
        assert_eq!(ctx.lookup("found_booking.0.amount"), Some(&json!(0)));
        assert!(ctx.contains_path("flag"));
        assert!(ctx.contains_path("empty"));
        assert!(!ctx.contains_path("found_booking.1"));
        assert!(!ctx.contains_path("missing.nested"));
    }

    #[test]
    fn null_values_count_as_absent() {
        let ctx = context(json!({"cleared": null}));
        assert!(!ctx.contains_path("cleared"));
    }

    #[test]
    fn set_path_creates_intermediate_objects() {
        let mut ctx = FlowContext::new();
        ctx.set_path("profile.address.city", json!("Harare"));
        assert_eq!(ctx.lookup("profile.address.city"), Some(&json!("Harare")));

        ctx.set_path("profile.address.city", json!("Bulawayo"));
        assert_eq!(ctx.lookup("profile.address.city"), Some(&json!("Bulawayo")));
    }

    #[test]
    fn patch_null_removes_and_values_overwrite() {
        let mut ctx = context(json!({"payment_failed": true, "keep": 1}));
        let patch = json!({"payment_failed": null, "payment_success": true, "nested.value": 2});
        ctx.apply_patch(patch.as_object().unwrap());

        assert!(!ctx.contains_path("payment_failed"));
        assert_eq!(ctx.get("payment_success"), Some(&json!(true)));
        assert_eq!(ctx.get("keep"), Some(&json!(1)));
        assert_eq!(ctx.lookup("nested.value"), Some(&json!(2)));
    }
}
