//! Fleet statistics: the per-key merge rule and fan-in bookkeeping.
//!
//! Every shard reports a flat JSON object. The master folds the reports together
//! according to an explicit classification table; unclassified keys are treated as
//! counters.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde_json::{Number, Value};

use crate::bridge::protocol::{CallId, ShardIndex};

/// One shard's (or the fleet's) statistics report.
pub type Stats = serde_json::Map<String, Value>;

/// How a stat key combines across shards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatKind {
    /// Same on every shard; the first value wins.
    Identity,
    /// Summed as `f64`.
    Fractional,
    /// Summed as `i64`.
    Integer,
}

/// Merges stat maps using a key classification table.
///
/// Keys missing from the table are additive: integer when both sides hold integers,
/// fractional otherwise. Non-numeric values under an additive key keep the first value.
#[derive(Debug, Clone)]
pub struct StatsReducer {
    kinds: HashMap<String, StatKind>,
}

impl Default for StatsReducer {
    fn default() -> Self {
        Self::empty()
            .with_kind("name", StatKind::Identity)
            .with_kind("shards", StatKind::Identity)
            .with_kind("orphan", StatKind::Identity)
            .with_kind("shardNum", StatKind::Identity)
            .with_kind("uptime", StatKind::Fractional)
            .with_kind("memory", StatKind::Fractional)
    }
}

impl StatsReducer {
    /// A reducer with no classified keys.
    pub fn empty() -> Self {
        Self {
            kinds: HashMap::new(),
        }
    }

    pub fn with_kind(mut self, key: impl Into<String>, kind: StatKind) -> Self {
        self.classify(key, kind);
        self
    }

    pub fn classify(&mut self, key: impl Into<String>, kind: StatKind) {
        self.kinds.insert(key.into(), kind);
    }

    pub fn kind_of(&self, key: &str) -> Option<StatKind> {
        self.kinds.get(key).copied()
    }

    /// Fold `other` into `current`.
    pub fn merge(&self, mut current: Stats, other: &Stats) -> Stats {
        for (key, value) in other {
            let merged = match current.get(key) {
                None => value.clone(),
                Some(existing) => self.merge_value(key, existing, value),
            };
            current.insert(key.clone(), merged);
        }
        current
    }

    /// Fold a sequence of reports left to right.
    pub fn reduce<'a, I>(&self, reports: I) -> Stats
    where
        I: IntoIterator<Item = &'a Stats>,
    {
        reports
            .into_iter()
            .fold(Stats::new(), |acc, report| self.merge(acc, report))
    }

    fn merge_value(&self, key: &str, current: &Value, other: &Value) -> Value {
        let merged = match self.kind_of(key) {
            Some(StatKind::Identity) => return current.clone(),
            Some(StatKind::Fractional) => add_f64(current, other),
            Some(StatKind::Integer) => add_i64(current, other).or_else(|| add_f64(current, other)),
            None if current.is_i64() && other.is_i64() => add_i64(current, other),
            None => add_f64(current, other),
        };

        merged.unwrap_or_else(|| {
            tracing::debug!(key, "Stat values cannot be summed, keeping first");
            current.clone()
        })
    }
}

fn add_i64(a: &Value, b: &Value) -> Option<Value> {
    a.as_i64()?.checked_add(b.as_i64()?).map(Value::from)
}

fn add_f64(a: &Value, b: &Value) -> Option<Value> {
    Number::from_f64(a.as_f64()? + b.as_f64()?).map(Value::Number)
}

/// An in-flight fleet `getStats` for one requesting shard.
///
/// Complete once every targeted shard has answered or failed. Further requests from
/// the same origin join as extra waiters and receive the same result.
#[derive(Debug)]
pub struct Aggregation {
    origin: ShardIndex,
    targets: BTreeSet<ShardIndex>,
    responded: BTreeSet<ShardIndex>,
    collected: BTreeMap<ShardIndex, Stats>,
    waiters: Vec<CallId>,
}

impl Aggregation {
    pub fn new(
        origin: ShardIndex,
        targets: impl IntoIterator<Item = ShardIndex>,
        waiter: CallId,
    ) -> Self {
        Self {
            origin,
            targets: targets.into_iter().collect(),
            responded: BTreeSet::new(),
            collected: BTreeMap::new(),
            waiters: vec![waiter],
        }
    }

    pub fn origin(&self) -> ShardIndex {
        self.origin
    }

    pub fn expected(&self) -> usize {
        self.targets.len()
    }

    pub fn collected(&self) -> usize {
        self.collected.len()
    }

    pub fn waiters(&self) -> &[CallId] {
        &self.waiters
    }

    pub fn add_waiter(&mut self, id: CallId) {
        self.waiters.push(id);
    }

    /// Record a shard's answer, `None` if its call failed.
    ///
    /// Returns false for shards that were not asked or already answered.
    pub fn record(&mut self, from: ShardIndex, stats: Option<Stats>) -> bool {
        if !self.targets.contains(&from) || !self.responded.insert(from) {
            return false;
        }
        if let Some(stats) = stats {
            self.collected.insert(from, stats);
        }
        true
    }

    pub fn is_complete(&self) -> bool {
        self.responded.len() == self.targets.len()
    }

    /// Reduce in shard-index order so identity keys do not depend on arrival order.
    pub fn finish(self, reducer: &StatsReducer) -> (Vec<CallId>, Stats) {
        let stats = reducer.reduce(self.collected.values());
        (self.waiters, stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn stats(value: Value) -> Stats {
        match value {
            Value::Object(map) => map,
            other => panic!("not an object: {other}"),
        }
    }

    #[test]
    fn merges_additive_and_identity_keys() {
        let reducer = StatsReducer::default();
        let merged = reducer.merge(
            stats(json!({"uptime": 10.0, "shards": 4, "name": "a"})),
            &stats(json!({"uptime": 20.0, "shards": 4, "name": "a"})),
        );

        assert_eq!(
            Value::Object(merged),
            json!({"uptime": 30.0, "shards": 4, "name": "a"})
        );
    }

    #[test]
    fn identity_keeps_first_value() {
        let reducer = StatsReducer::default();
        let merged = reducer.reduce(&[
            stats(json!({"name": "first", "orphan": false, "shardNum": 0})),
            stats(json!({"name": "second", "orphan": true, "shardNum": 1})),
        ]);

        assert_eq!(
            Value::Object(merged),
            json!({"name": "first", "orphan": false, "shardNum": 0})
        );
    }

    #[test]
    fn one_sided_keys_carry_through() {
        let reducer = StatsReducer::default();
        let merged = reducer.reduce(&[
            stats(json!({"numberOfGuilds": 3})),
            stats(json!({})),
            stats(json!({"memory": 12.5})),
        ]);

        assert_eq!(
            Value::Object(merged),
            json!({"numberOfGuilds": 3, "memory": 12.5})
        );
    }

    #[test]
    fn unclassified_integers_sum_as_integers() {
        let reducer = StatsReducer::default();
        let merged = reducer.reduce(&[
            stats(json!({"x": 1})),
            stats(json!({"x": 2})),
            stats(json!({"x": 3})),
        ]);

        assert_eq!(merged["x"], json!(6));
        assert!(merged["x"].is_i64());
    }

    #[test]
    fn unclassified_mixed_numbers_sum_as_floats() {
        let reducer = StatsReducer::default();
        let merged = reducer.merge(stats(json!({"load": 1})), &stats(json!({"load": 0.5})));

        assert_eq!(merged["load"], json!(1.5));
    }

    #[test]
    fn fractional_keys_are_floats_even_for_integer_inputs() {
        let reducer = StatsReducer::default();
        let merged = reducer.merge(stats(json!({"uptime": 1})), &stats(json!({"uptime": 2})));

        assert_eq!(merged["uptime"], json!(3.0));
        assert!(merged["uptime"].is_f64());
    }

    #[test]
    fn non_numeric_counter_keeps_first() {
        let reducer = StatsReducer::default();
        let merged = reducer.merge(
            stats(json!({"numberOfGuilds": "many"})),
            &stats(json!({"numberOfGuilds": 4})),
        );

        assert_eq!(merged["numberOfGuilds"], json!("many"));
    }

    #[test]
    fn classification_table_is_extensible() {
        let reducer = StatsReducer::default().with_kind("region", StatKind::Identity);
        let merged = reducer.merge(stats(json!({"region": 1})), &stats(json!({"region": 2})));

        assert_eq!(merged["region"], json!(1));
        assert_eq!(reducer.kind_of("uptime"), Some(StatKind::Fractional));
        assert_eq!(StatsReducer::empty().kind_of("uptime"), None);
    }

    #[test]
    fn additive_totals_do_not_depend_on_order() {
        let reducer = StatsReducer::default();
        let a = stats(json!({"uptime": 1.5, "messages": 10, "name": "a"}));
        let b = stats(json!({"uptime": 2.25, "messages": 5}));
        let c = stats(json!({"memory": 3.0, "messages": 1, "name": "c"}));

        let orders = [
            [&a, &b, &c],
            [&c, &b, &a],
            [&b, &a, &c],
            [&c, &a, &b],
        ];
        for order in orders {
            let merged = reducer.reduce(order);
            assert_eq!(merged["uptime"], json!(3.75));
            assert_eq!(merged["messages"], json!(16));
            assert_eq!(merged["memory"], json!(3.0));
        }
    }

    #[test]
    fn aggregation_completes_after_every_target() {
        let mut agg = Aggregation::new(0, [0, 1, 2], 41);
        assert_eq!(agg.expected(), 3);

        assert!(agg.record(2, Some(stats(json!({"x": 3})))));
        assert!(agg.record(0, Some(stats(json!({"x": 1})))));
        assert!(!agg.is_complete());
        assert!(agg.record(1, Some(stats(json!({"x": 2})))));
        assert!(agg.is_complete());

        let (waiters, merged) = agg.finish(&StatsReducer::default());
        assert_eq!(waiters, vec![41]);
        assert_eq!(Value::Object(merged), json!({"x": 6}));
    }

    #[test]
    fn aggregation_ignores_strangers_and_duplicates() {
        let mut agg = Aggregation::new(1, [0, 1], 7);

        assert!(!agg.record(5, Some(stats(json!({"x": 100})))));
        assert!(agg.record(0, Some(stats(json!({"x": 1})))));
        assert!(!agg.record(0, Some(stats(json!({"x": 1})))));
        assert_eq!(agg.collected(), 1);
    }

    #[test]
    fn failed_shards_count_toward_completion() {
        let mut agg = Aggregation::new(0, [0, 1], 3);
        agg.add_waiter(4);

        agg.record(0, Some(stats(json!({"x": 1}))));
        agg.record(1, None);
        assert!(agg.is_complete());

        let (waiters, merged) = agg.finish(&StatsReducer::default());
        assert_eq!(waiters, vec![3, 4]);
        assert_eq!(Value::Object(merged), json!({"x": 1}));
    }

    #[test]
    fn identity_follows_shard_order_not_arrival() {
        let mut agg = Aggregation::new(0, [0, 1], 1);
        agg.record(1, Some(stats(json!({"name": "late"}))));
        agg.record(0, Some(stats(json!({"name": "early"}))));

        let (_, merged) = agg.finish(&StatsReducer::default());
        assert_eq!(merged["name"], json!("early"));
    }
}
