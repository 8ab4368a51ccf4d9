//! 查询描述与缓存结果
//!
//! `QuerySpec` 是不可变的 (filter, sort, pagination) 三元组；等价查询共用同一个
//! 缓存 key（规范化 JSON 的 SHA-256）。`CachedQuery` 是持久化下来的有序实体列表。

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::cmp::Ordering;

use super::entities::{EntityKey, EntityKind, EntityRecord};

/// 过滤条件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Filter {
    /// 不过滤
    All,
    /// 字段等于；数组字段（如 members）表示包含
    Eq { field: String, value: Value },
    Ne { field: String, value: Value },
    In { field: String, values: Vec<Value> },
    And { filters: Vec<Filter> },
    Or { filters: Vec<Filter> },
}

impl Filter {
    pub fn eq(field: &str, value: impl Into<Value>) -> Self {
        Filter::Eq {
            field: field.to_string(),
            value: value.into(),
        }
    }

    pub fn ne(field: &str, value: impl Into<Value>) -> Self {
        Filter::Ne {
            field: field.to_string(),
            value: value.into(),
        }
    }

    pub fn in_values<I, V>(field: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Filter::In {
            field: field.to_string(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn and(filters: Vec<Filter>) -> Self {
        Filter::And { filters }
    }

    pub fn or(filters: Vec<Filter>) -> Self {
        Filter::Or { filters }
    }

    /// 本地评估（用于实时事件合并）
    pub fn matches(&self, record: &EntityRecord) -> bool {
        match self {
            Filter::All => true,
            Filter::Eq { field, value } => field_equals(record, field, value),
            Filter::Ne { field, value } => !field_equals(record, field, value),
            Filter::In { field, values } => values.iter().any(|v| field_equals(record, field, v)),
            Filter::And { filters } => filters.iter().all(|f| f.matches(record)),
            Filter::Or { filters } => filters.iter().any(|f| f.matches(record)),
        }
    }
}

impl Default for Filter {
    fn default() -> Self {
        Filter::All
    }
}

fn field_equals(record: &EntityRecord, field: &str, expected: &Value) -> bool {
    match record.field(field) {
        Some(Value::Array(items)) => items.iter().any(|item| item == expected),
        Some(actual) => &actual == expected,
        None => expected.is_null(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    LastMessageAt,
    CreatedAt,
    UpdatedAt,
    Attribute(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortField {
    pub key: SortKey,
    pub direction: SortDirection,
}

impl SortField {
    pub fn descending(key: SortKey) -> Self {
        Self {
            key,
            direction: SortDirection::Descending,
        }
    }

    pub fn ascending(key: SortKey) -> Self {
        Self {
            key,
            direction: SortDirection::Ascending,
        }
    }

    fn value_of(&self, record: &EntityRecord) -> Option<Value> {
        match &self.key {
            SortKey::LastMessageAt => record.last_message_at.map(Value::from),
            SortKey::CreatedAt => record.created_at.map(Value::from),
            SortKey::UpdatedAt => record.updated_at.map(Value::from),
            SortKey::Attribute(name) => record.attributes.get(name).cloned(),
        }
    }
}

/// 按排序规则比较两个实体；缺失值总是排在最后，最后按 key 打破平局
pub fn compare_records(sort: &[SortField], a: &EntityRecord, b: &EntityRecord) -> Ordering {
    for field in sort {
        let ordering = match (field.value_of(a), field.value_of(b)) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(x), Some(y)) => {
                let natural = compare_values(&x, &y);
                match field.direction {
                    SortDirection::Ascending => natural,
                    SortDirection::Descending => natural.reverse(),
                }
            }
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    a.key.cmp(&b.key)
}

fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => Ordering::Equal,
    }
}

/// 分页游标
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub offset: u32,
    pub limit: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 30,
        }
    }
}

/// 查询描述（不可变）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuerySpec {
    pub kind: EntityKind,
    pub filter: Filter,
    pub sort: Vec<SortField>,
    pub pagination: Pagination,
}

impl QuerySpec {
    pub fn new(kind: EntityKind, filter: Filter, sort: Vec<SortField>) -> Self {
        Self {
            kind,
            filter,
            sort,
            pagination: Pagination::default(),
        }
    }

    pub fn channels(filter: Filter, sort: Vec<SortField>) -> Self {
        Self::new(EntityKind::Channel, filter, sort)
    }

    /// 某频道的消息，按发送时间正序
    pub fn messages(cid: &str) -> Self {
        Self::new(
            EntityKind::Message,
            Filter::eq("parent", cid),
            vec![SortField::ascending(SortKey::CreatedAt)],
        )
    }

    pub fn with_pagination(mut self, offset: u32, limit: u32) -> Self {
        self.pagination = Pagination { offset, limit };
        self
    }

    /// 等价查询的缓存 key
    pub fn key(&self) -> String {
        // 序列化失败只可能来自非字符串 map key，这里的类型不会出现
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha256::digest(&canonical))
    }

    /// 实体是否属于该查询
    pub fn matches(&self, record: &EntityRecord) -> bool {
        record.key.kind == self.kind && !record.is_deleted() && self.filter.matches(record)
    }

    /// 按查询排序规则排序
    pub fn sort_records(&self, records: &mut [EntityRecord]) {
        records.sort_by(|a, b| compare_records(&self.sort, a, b));
    }
}

/// 查询缓存结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedQuery {
    pub spec_key: String,
    pub keys: Vec<EntityKey>,
    pub updated_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn channel(id: &str, last_message_at: Option<i64>) -> EntityRecord {
        let mut record = EntityRecord::channel("messaging", id).with_members(["alice"]);
        record.last_message_at = last_message_at;
        record
    }

    #[test]
    fn equivalent_specs_share_a_key() {
        let a = QuerySpec::channels(
            Filter::eq("members", "alice"),
            vec![SortField::descending(SortKey::LastMessageAt)],
        );
        let b = a.clone();
        let c = a.clone().with_pagination(30, 30);
        assert_eq!(a.key(), b.key());
        assert_ne!(a.key(), c.key());
        assert_eq!(a.key().len(), 64);
    }

    #[test]
    fn filter_matches_members_and_attributes() {
        let record = channel("general", None).with_attribute("frozen", json!(false));
        assert!(Filter::All.matches(&record));
        assert!(Filter::eq("members", "alice").matches(&record));
        assert!(!Filter::eq("members", "bob").matches(&record));
        assert!(Filter::in_values("type", ["messaging", "team"]).matches(&record));
        assert!(Filter::and(vec![
            Filter::eq("frozen", false),
            Filter::ne("id", "random"),
        ])
        .matches(&record));
        assert!(Filter::or(vec![Filter::eq("id", "x"), Filter::eq("id", "general")]).matches(&record));
    }

    #[test]
    fn deleted_records_never_match() {
        let spec = QuerySpec::channels(Filter::All, vec![]);
        let mut record = channel("general", None);
        assert!(spec.matches(&record));
        record.deleted_at = Some(1);
        assert!(!spec.matches(&record));
    }

    #[test]
    fn sort_by_last_message_descending_with_missing_last() {
        let spec = QuerySpec::channels(
            Filter::All,
            vec![SortField::descending(SortKey::LastMessageAt)],
        );
        let mut records = vec![
            channel("a", Some(10)),
            channel("b", None),
            channel("c", Some(30)),
            channel("d", Some(20)),
        ];
        spec.sort_records(&mut records);
        let ids: Vec<_> = records.iter().map(|r| r.key.id.as_str()).collect();
        assert_eq!(ids, vec!["messaging:c", "messaging:d", "messaging:a", "messaging:b"]);
    }
}
