use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ChatFlowError, Result};
use crate::template::coerce::{loosely_equal, to_display, to_f64};

pub type Record = Map<String, Value>;

/// 业务实体存储约定（客户、预订、付款等记录）
#[async_trait]
pub trait BusinessStore: Send + Sync {
    async fn query(&self, query: &RecordQuery) -> Result<Vec<Record>>;
    async fn create(&self, entity: &str, fields: Record) -> Result<Record>;
    async fn update(&self, entity: &str, id: &str, fields: Record) -> Result<Record>;
}

/// 结构化查询
///
/// 过滤键支持 `field__lookup` 形式：`exact`（缺省）、`iexact`、`contains`、`icontains`、
/// `startswith`、`gt`、`gte`、`lt`、`lte`、`in`、`isnull`。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordQuery {
    pub entity: String,
    #[serde(default)]
    pub filters: Map<String, Value>,
    #[serde(default)]
    pub fields: Vec<String>,
    #[serde(default)]
    pub limit: Option<usize>,
    /// `-field` 表示降序
    #[serde(default)]
    pub order_by: Vec<String>,
}

impl RecordQuery {
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            ..Self::default()
        }
    }

    pub fn filter(mut self, key: impl Into<String>, value: Value) -> Self {
        self.filters.insert(key.into(), value);
        self
    }

    pub fn matches(&self, record: &Record) -> bool {
        self.filters
            .iter()
            .all(|(key, expected)| lookup_matches(record, key, expected))
    }

    fn project(&self, record: &Record) -> Record {
        if self.fields.is_empty() {
            return record.clone();
        }
        self.fields
            .iter()
            .filter_map(|field| record.get(field).map(|value| (field.clone(), value.clone())))
            .collect()
    }
}

fn lookup_matches(record: &Record, key: &str, expected: &Value) -> bool {
    let (field, lookup) = key.split_once("__").unwrap_or((key, "exact"));
    let actual = record.get(field).filter(|value| !value.is_null());
    let text = |value: &Value| to_display(value).to_lowercase();
    match lookup {
        "isnull" => {
            let want_null = expected.as_bool().unwrap_or_else(|| to_display(expected) == "true");
            actual.is_none() == want_null
        }
        "in" => match (actual, expected) {
            (Some(actual), Value::Array(options)) => {
                options.iter().any(|option| loosely_equal(actual, option))
            }
            _ => false,
        },
        _ => {
            let Some(actual) = actual else {
                return false;
            };
            match lookup {
                "exact" => loosely_equal(actual, expected),
                "iexact" => text(actual) == text(expected),
                "contains" => to_display(actual).contains(&to_display(expected)),
                "icontains" => text(actual).contains(&text(expected)),
                "startswith" => to_display(actual).starts_with(&to_display(expected)),
                "gt" | "gte" | "lt" | "lte" => match (to_f64(actual), to_f64(expected)) {
                    (Some(a), Some(b)) => match lookup {
                        "gt" => a > b,
                        "gte" => a >= b,
                        "lt" => a < b,
                        _ => a <= b,
                    },
                    _ => {
                        let (a, b) = (to_display(actual), to_display(expected));
                        match lookup {
                            "gt" => a > b,
                            "gte" => a >= b,
                            "lt" => a < b,
                            _ => a <= b,
                        }
                    }
                },
                _ => false,
            }
        }
    }
}

fn compare_field(a: &Record, b: &Record, field: &str) -> CmpOrdering {
    match (a.get(field), b.get(field)) {
        (Some(x), Some(y)) => match (to_f64(x), to_f64(y)) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(CmpOrdering::Equal),
            _ => to_display(x).cmp(&to_display(y)),
        },
        (Some(_), None) => CmpOrdering::Greater,
        (None, Some(_)) => CmpOrdering::Less,
        (None, None) => CmpOrdering::Equal,
    }
}

/// 内存业务存储，用于测试与本地模拟
pub struct InMemoryBusinessStore {
    tables: RwLock<HashMap<String, Vec<Record>>>,
    next_id: AtomicU64,
}

impl InMemoryBusinessStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// 预置记录；缺少 `id` 时自动分配
    pub fn seed(&self, entity: &str, records: Vec<Value>) {
        let mut tables = self.tables.write();
        let table = tables.entry(entity.to_string()).or_default();
        for record in records {
            if let Value::Object(mut record) = record {
                self.assign_id(&mut record);
                table.push(record);
            }
        }
    }

    pub fn all(&self, entity: &str) -> Vec<Record> {
        self.tables.read().get(entity).cloned().unwrap_or_default()
    }

    fn assign_id(&self, record: &mut Record) {
        if !record.contains_key("id") {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            record.insert("id".to_string(), Value::from(id));
        }
    }
}

impl Default for InMemoryBusinessStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BusinessStore for InMemoryBusinessStore {
    async fn query(&self, query: &RecordQuery) -> Result<Vec<Record>> {
        let tables = self.tables.read();
        let mut rows: Vec<&Record> = tables
            .get(&query.entity)
            .map(|table| table.iter().filter(|record| query.matches(record)).collect())
            .unwrap_or_default();
        rows.sort_by(|a, b| {
            query
                .order_by
                .iter()
                .map(|key| match key.strip_prefix('-') {
                    Some(field) => compare_field(b, a, field),
                    None => compare_field(a, b, key),
                })
                .find(|ordering| *ordering != CmpOrdering::Equal)
                .unwrap_or(CmpOrdering::Equal)
        });
        Ok(rows
            .into_iter()
            .take(query.limit.unwrap_or(usize::MAX))
            .map(|record| query.project(record))
            .collect())
    }

    async fn create(&self, entity: &str, mut fields: Record) -> Result<Record> {
        self.assign_id(&mut fields);
        self.tables
            .write()
            .entry(entity.to_string())
            .or_default()
            .push(fields.clone());
        Ok(fields)
    }

    async fn update(&self, entity: &str, id: &str, fields: Record) -> Result<Record> {
        let mut tables = self.tables.write();
        let record = tables
            .get_mut(entity)
            .and_then(|table| {
                table.iter_mut().find(|record| {
                    record
                        .get("id")
                        .map(|value| to_display(value) == id)
                        .unwrap_or(false)
                })
            })
            .ok_or_else(|| {
                ChatFlowError::action("update_record", format!("{} `{}` not found", entity, id))
            })?;
        for (key, value) in fields {
            record.insert(key, value);
        }
        Ok(record.clone())
    }
}
