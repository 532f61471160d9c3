//! Condition evaluation
//!
//! Depth-first with short-circuiting: AND stops on the first false child,
//! OR on the first true one. Trees deeper than `MAX_DEPTH` evaluate false.

use chrono::Utc;
use std::collections::{HashMap, HashSet};

use super::projection::ProjectionSet;
use super::{Condition, GroupOperator, LeafCondition, RuleField, RuleOperator, MAX_DEPTH};
use crate::qbit::TorrentInfo;
use crate::sync::filter::StatusBucket;
use crate::sync::index::{normalize_name, HardlinkScope};
use crate::utils::tracker_domain;

/// Minimum normalized length for substring name matching; shorter names
/// produce too many false positives.
const MIN_NORMALIZED_LEN: usize = 10;

/// One torrent of a category, pre-lowered for name lookups
#[derive(Debug, Clone)]
pub struct CategoryEntry {
    pub hash: String,
    pub name_lower: String,
    pub normalized: String,
}

impl CategoryEntry {
    pub fn from_torrent(t: &TorrentInfo) -> Self {
        Self {
            hash: t.hash.clone(),
            name_lower: t.name.to_lowercase(),
            normalized: normalize_name(&t.name),
        }
    }
}

/// Auxiliary data the evaluator consults. Leaves that need data the context
/// does not carry (hardlink scope, missing files without a collector)
/// evaluate false rather than guessing.
#[derive(Debug, Clone, Default)]
pub struct EvalContext {
    /// Fixed evaluation clock; 0 falls back to wall time
    pub now_unix: i64,
    pub unregistered: HashSet<String>,
    pub tracker_down: HashSet<String>,
    pub missing_files: HashSet<String>,
    pub hardlink_scope: HashMap<String, HardlinkScope>,
    pub has_hardlink_data: bool,
    /// category -> member torrents, for existsIn/containsIn
    pub category_index: HashMap<String, Vec<CategoryEntry>>,
    /// tracker domain -> operator-facing display name
    pub tracker_display_names: HashMap<String, String>,
    /// hash -> upstream comment, fetched on demand by callers that need it
    pub comments: HashMap<String, String>,
    pub projections: ProjectionSet,
}

impl EvalContext {
    pub fn now(&self) -> i64 {
        if self.now_unix != 0 {
            self.now_unix
        } else {
            Utc::now().timestamp()
        }
    }
}

/// Evaluate a condition against one torrent
pub fn evaluate(cond: &Condition, t: &TorrentInfo, ctx: &EvalContext) -> bool {
    eval_at(cond, t, ctx, 1)
}

fn eval_at(cond: &Condition, t: &TorrentInfo, ctx: &EvalContext, depth: usize) -> bool {
    if depth > MAX_DEPTH {
        return false;
    }
    match cond {
        Condition::Group(group) => {
            let result = match group.operator {
                GroupOperator::And => group
                    .conditions
                    .iter()
                    .all(|c| eval_at(c, t, ctx, depth + 1)),
                GroupOperator::Or => group
                    .conditions
                    .iter()
                    .any(|c| eval_at(c, t, ctx, depth + 1)),
            };
            result != group.negate
        }
        Condition::Leaf(leaf) => eval_leaf(leaf, t, ctx),
    }
}

fn eval_leaf(leaf: &LeafCondition, t: &TorrentInfo, ctx: &EvalContext) -> bool {
    use RuleField::*;
    match leaf.field {
        Name => eval_string_field(leaf, &t.name, t, ctx),
        Hash => eval_string_field(leaf, &t.hash, t, ctx),
        Category => eval_string_field(leaf, &t.category, t, ctx),
        SavePath => eval_string_field(leaf, &t.save_path, t, ctx),
        ContentPath => eval_string_field(leaf, &t.content_path, t, ctx),
        Comment => {
            let comment = ctx.comments.get(&t.hash).map(String::as_str).unwrap_or("");
            eval_string_field(leaf, comment, t, ctx)
        }
        Tags => eval_tags(leaf, t),
        State => eval_state(leaf, t, ctx),
        Tracker => eval_tracker(leaf, t, ctx),
        Private => eval_bool(leaf, t.is_private),
        IsUnregistered => eval_bool(leaf, ctx.unregistered.contains(&t.hash)),
        HasMissingFiles => eval_bool(
            leaf,
            ctx.missing_files.contains(&t.hash) || t.state == "missingFiles",
        ),
        HardlinkScope => eval_hardlink_scope(leaf, t, ctx),
        _ => eval_numeric(leaf, t, ctx),
    }
}

// ---- string evaluation ----

fn value_str(leaf: &LeafCondition) -> Option<String> {
    match leaf.value.as_ref()? {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn string_op(op: RuleOperator, candidate: &str, value: &str, leaf: &LeafCondition) -> bool {
    let c = candidate.to_lowercase();
    let v = value.to_lowercase();
    match op {
        RuleOperator::Equal => c == v,
        RuleOperator::NotEqual => c != v,
        RuleOperator::Contains => c.contains(&v),
        RuleOperator::NotContains => !c.contains(&v),
        RuleOperator::StartsWith => c.starts_with(&v),
        RuleOperator::EndsWith => c.ends_with(&v),
        RuleOperator::Matches => leaf.regex().map(|re| re.is_match(candidate)).unwrap_or(false),
        _ => false,
    }
}

fn eval_string_field(leaf: &LeafCondition, s: &str, t: &TorrentInfo, ctx: &EvalContext) -> bool {
    match leaf.operator {
        RuleOperator::ExistsIn => eval_category_lookup(leaf, s, t, ctx, false),
        RuleOperator::ContainsIn => eval_category_lookup(leaf, s, t, ctx, true),
        op => match value_str(leaf) {
            Some(v) => string_op(op, s, &v, leaf),
            None => false,
        },
    }
}

/// Cross-category name lookup. Exact lowercased match always counts;
/// `containsIn` additionally accepts a bidirectional normalized-substring
/// match. The torrent never matches itself.
fn eval_category_lookup(
    leaf: &LeafCondition,
    s: &str,
    t: &TorrentInfo,
    ctx: &EvalContext,
    substring: bool,
) -> bool {
    let category = match value_str(leaf) {
        Some(v) => v,
        None => return false,
    };
    let entries = match ctx.category_index.get(&category) {
        Some(e) => e,
        None => return false,
    };

    let lower = s.to_lowercase();
    let normalized = normalize_name(s);

    entries.iter().any(|entry| {
        if entry.hash == t.hash {
            return false;
        }
        if entry.name_lower == lower {
            return true;
        }
        if substring
            && normalized.len() >= MIN_NORMALIZED_LEN
            && entry.normalized.len() >= MIN_NORMALIZED_LEN
        {
            return entry.normalized.contains(&normalized)
                || normalized.contains(&entry.normalized);
        }
        false
    })
}

// ---- tags / tracker / state ----

/// String operators apply per-tag; negative operators require every tag to
/// miss; `matches` tests the joined string.
fn eval_tags(leaf: &LeafCondition, t: &TorrentInfo) -> bool {
    if leaf.operator == RuleOperator::Matches {
        return leaf.regex().map(|re| re.is_match(&t.tags)).unwrap_or(false);
    }
    let value = match value_str(leaf) {
        Some(v) => v,
        None => return false,
    };
    let tags = t.tag_list();
    match leaf.operator {
        RuleOperator::NotEqual | RuleOperator::NotContains => {
            let positive = match leaf.operator {
                RuleOperator::NotEqual => RuleOperator::Equal,
                _ => RuleOperator::Contains,
            };
            !tags.iter().any(|tag| string_op(positive, tag, &value, leaf))
        }
        op => tags.iter().any(|tag| string_op(op, tag, &value, leaf)),
    }
}

/// Candidates are the raw primary tracker URL, its extracted domain, and
/// the configured display name if any. Equality holds when any candidate
/// matches; negative operators need every candidate to miss.
fn eval_tracker(leaf: &LeafCondition, t: &TorrentInfo, ctx: &EvalContext) -> bool {
    let mut candidates: Vec<String> = vec![t.tracker.clone()];
    let domain = tracker_domain(&t.tracker);
    if let Some(ref d) = domain {
        candidates.push(d.clone());
        if let Some(display) = ctx.tracker_display_names.get(d) {
            candidates.push(display.clone());
        }
    }

    if leaf.operator == RuleOperator::Matches {
        return leaf
            .regex()
            .map(|re| candidates.iter().any(|c| re.is_match(c)))
            .unwrap_or(false);
    }
    let value = match value_str(leaf) {
        Some(v) => v,
        None => return false,
    };
    match leaf.operator {
        RuleOperator::NotEqual | RuleOperator::NotContains => {
            let positive = match leaf.operator {
                RuleOperator::NotEqual => RuleOperator::Equal,
                _ => RuleOperator::Contains,
            };
            !candidates
                .iter()
                .any(|c| string_op(positive, c, &value, leaf))
        }
        op => candidates.iter().any(|c| string_op(op, c, &value, leaf)),
    }
}

/// State equality first tries the bucket taxonomy, then falls back to the
/// raw upstream state string.
fn eval_state(leaf: &LeafCondition, t: &TorrentInfo, ctx: &EvalContext) -> bool {
    let value = match value_str(leaf) {
        Some(v) => v,
        None => return false,
    };

    let matched = match StatusBucket::parse(&value) {
        Some(bucket) => bucket.matches(t, &ctx.unregistered, &ctx.tracker_down),
        None => t.state.eq_ignore_ascii_case(&value),
    };

    match leaf.operator {
        RuleOperator::Equal => matched,
        RuleOperator::NotEqual => !matched,
        _ => false,
    }
}

// ---- booleans ----

fn eval_bool(leaf: &LeafCondition, actual: bool) -> bool {
    let expected = match leaf.value.as_ref() {
        Some(serde_json::Value::Bool(b)) => *b,
        Some(serde_json::Value::String(s)) => s.eq_ignore_ascii_case("true"),
        _ => return false,
    };
    match leaf.operator {
        RuleOperator::Equal => actual == expected,
        RuleOperator::NotEqual => actual != expected,
        _ => false,
    }
}

fn eval_hardlink_scope(leaf: &LeafCondition, t: &TorrentInfo, ctx: &EvalContext) -> bool {
    if !ctx.has_hardlink_data {
        return false;
    }
    let scope = match ctx.hardlink_scope.get(&t.hash) {
        Some(s) => s,
        None => return false,
    };
    let actual = match scope {
        HardlinkScope::None => "none",
        HardlinkScope::Internal => "internal",
        HardlinkScope::External => "external",
        HardlinkScope::Mixed => "mixed",
    };
    let value = match value_str(leaf) {
        Some(v) => v,
        None => return false,
    };
    match leaf.operator {
        RuleOperator::Equal => actual.eq_ignore_ascii_case(&value),
        RuleOperator::NotEqual => !actual.eq_ignore_ascii_case(&value),
        _ => false,
    }
}

// ---- numerics ----

/// Historical rules wrote progress as 0-100; normalize every input to the
/// 0.0-1.0 scale before comparing.
fn normalize_progress(v: f64) -> f64 {
    let v = if v > 1.0 { v / 100.0 } else { v };
    v.clamp(0.0, 1.0)
}

fn value_f64(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// The field's numeric reading, or None when the condition can never match
/// (zero age base, missing projection data).
fn numeric_value(field: RuleField, t: &TorrentInfo, ctx: &EvalContext) -> Option<f64> {
    use RuleField::*;
    let v = match field {
        Size => t.size as f64,
        TotalSize => t.total_size as f64,
        Downloaded => t.downloaded as f64,
        Uploaded => t.uploaded as f64,
        AmountLeft => t.amount_left as f64,
        Ratio => t.ratio,
        Progress => normalize_progress(t.progress),
        Availability => t.availability,
        DlSpeed => t.dlspeed as f64,
        UpSpeed => t.upspeed as f64,
        NumSeeds => t.num_seeds as f64,
        NumLeechs => t.num_leechs as f64,
        NumComplete => t.num_complete as f64,
        NumIncomplete => t.num_incomplete as f64,
        TrackersCount => t.trackers.iter().filter(|tr| tr.is_real_tracker()).count() as f64,
        SeedingTime => t.seeding_time as f64,
        TimeActive => t.time_active as f64,
        AddedOn => t.added_on as f64,
        CompletionOn => t.completion_on as f64,
        LastActivity => t.last_activity as f64,
        AddedOnAge => age_of(t.added_on, ctx)?,
        CompletionOnAge => {
            if t.completion_on <= 0 {
                return None;
            }
            age_of(t.completion_on, ctx)?
        }
        LastActivityAge => age_of(t.last_activity, ctx)?,
        FreeSpace => ctx.projections.projected_free_space()? as f64,
        _ => return None,
    };
    Some(v)
}

fn age_of(base: i64, ctx: &EvalContext) -> Option<f64> {
    if base == 0 {
        return None;
    }
    Some((ctx.now() - base).max(0) as f64)
}

fn eval_numeric(leaf: &LeafCondition, t: &TorrentInfo, ctx: &EvalContext) -> bool {
    let actual = match numeric_value(leaf.field, t, ctx) {
        Some(v) => v,
        None => return false,
    };

    if leaf.operator == RuleOperator::Between {
        let (min, max) = match (leaf.min_value, leaf.max_value) {
            (Some(min), Some(max)) => (min, max),
            _ => return false,
        };
        let (min, max) = if leaf.field == RuleField::Progress {
            (normalize_progress(min), normalize_progress(max))
        } else {
            (min, max)
        };
        return actual >= min && actual <= max;
    }

    let mut expected = match leaf.value.as_ref().and_then(value_f64) {
        Some(v) => v,
        None => return false,
    };
    if leaf.field == RuleField::Progress {
        expected = normalize_progress(expected);
    }

    match leaf.operator {
        RuleOperator::Equal => actual == expected,
        RuleOperator::NotEqual => actual != expected,
        RuleOperator::GreaterThan => actual > expected,
        RuleOperator::GreaterOrEqual => actual >= expected,
        RuleOperator::LessThan => actual < expected,
        RuleOperator::LessOrEqual => actual <= expected,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::Condition;
    use serde_json::json;

    fn torrent(hash: &str, name: &str) -> TorrentInfo {
        TorrentInfo {
            hash: hash.to_string(),
            name: name.to_string(),
            ..Default::default()
        }
    }

    fn leaf(field: RuleField, op: RuleOperator, value: serde_json::Value) -> Condition {
        Condition::leaf(field, op, value)
    }

    #[test]
    fn test_progress_normalization_scenario() {
        let ctx = EvalContext::default();
        let rule = leaf(RuleField::Progress, RuleOperator::GreaterOrEqual, json!(50));

        let mut half = torrent("A", "a");
        half.progress = 0.5;
        assert!(evaluate(&rule, &half, &ctx));

        let mut historical = torrent("B", "b");
        historical.progress = 50.0;
        assert!(evaluate(&rule, &historical, &ctx));

        let mut below = torrent("C", "c");
        below.progress = 0.49;
        assert!(!evaluate(&rule, &below, &ctx));
    }

    #[test]
    fn test_exists_in_with_self_exclusion() {
        let h1 = TorrentInfo {
            hash: "H1".to_string(),
            name: "Movie A".to_string(),
            category: "movies".to_string(),
            ..Default::default()
        };
        let h2 = TorrentInfo {
            hash: "H2".to_string(),
            name: "Movie A".to_string(),
            category: "archive".to_string(),
            ..Default::default()
        };

        let mut ctx = EvalContext::default();
        ctx.category_index.insert(
            "archive".to_string(),
            vec![CategoryEntry::from_torrent(&h2)],
        );
        ctx.category_index.insert(
            "movies".to_string(),
            vec![CategoryEntry::from_torrent(&h1)],
        );

        let rule = leaf(RuleField::Name, RuleOperator::ExistsIn, json!("archive"));
        assert!(evaluate(&rule, &h1, &ctx));
        // h2 is the only archive member: self-exclusion
        assert!(!evaluate(&rule, &h2, &ctx));
    }

    #[test]
    fn test_contains_in_normalized_substring() {
        let other = TorrentInfo {
            hash: "H2".to_string(),
            name: "Some.Long.Release.Name.2160p-GRP".to_string(),
            category: "archive".to_string(),
            ..Default::default()
        };
        let mut ctx = EvalContext::default();
        ctx.category_index.insert(
            "archive".to_string(),
            vec![CategoryEntry::from_torrent(&other)],
        );

        let t = torrent("H1", "some long release name");
        let rule = leaf(RuleField::Name, RuleOperator::ContainsIn, json!("archive"));
        assert!(evaluate(&rule, &t, &ctx));

        // Short normalized names never substring-match
        let short = torrent("H3", "name");
        assert!(!evaluate(&rule, &short, &ctx));
    }

    #[test]
    fn test_age_fields_use_context_clock() {
        let mut t = torrent("A", "a");
        t.added_on = 1_000;
        let ctx = EvalContext {
            now_unix: 4_600,
            ..Default::default()
        };
        let rule = leaf(RuleField::AddedOnAge, RuleOperator::GreaterOrEqual, json!(3600));
        assert!(evaluate(&rule, &t, &ctx));

        let younger_ctx = EvalContext {
            now_unix: 2_000,
            ..Default::default()
        };
        assert!(!evaluate(&rule, &t, &younger_ctx));
    }

    #[test]
    fn test_zero_timestamp_never_matches() {
        let t = torrent("A", "a");
        let ctx = EvalContext {
            now_unix: 1_000_000,
            ..Default::default()
        };
        let rule = leaf(RuleField::CompletionOnAge, RuleOperator::GreaterThan, json!(0));
        assert!(!evaluate(&rule, &t, &ctx));
    }

    #[test]
    fn test_tags_per_tag_operators() {
        let mut t = torrent("A", "a");
        t.tags = "linux,iso".to_string();
        let ctx = EvalContext::default();

        assert!(evaluate(
            &leaf(RuleField::Tags, RuleOperator::Equal, json!("iso")),
            &t,
            &ctx
        ));
        assert!(!evaluate(
            &leaf(RuleField::Tags, RuleOperator::Equal, json!("linux,iso")),
            &t,
            &ctx
        ));
        // Negative requires every tag to miss
        assert!(!evaluate(
            &leaf(RuleField::Tags, RuleOperator::NotContains, json!("lin")),
            &t,
            &ctx
        ));
        assert!(evaluate(
            &leaf(RuleField::Tags, RuleOperator::NotContains, json!("windows")),
            &t,
            &ctx
        ));
    }

    #[test]
    fn test_tracker_candidate_set() {
        let mut t = torrent("A", "a");
        t.tracker = "https://tracker.example.org/announce?passkey=x".to_string();
        let mut ctx = EvalContext::default();
        ctx.tracker_display_names
            .insert("example.org".to_string(), "Example".to_string());

        assert!(evaluate(
            &leaf(RuleField::Tracker, RuleOperator::Equal, json!("example.org")),
            &t,
            &ctx
        ));
        assert!(evaluate(
            &leaf(RuleField::Tracker, RuleOperator::Equal, json!("Example")),
            &t,
            &ctx
        ));
        // Not-equal needs every candidate to miss
        assert!(!evaluate(
            &leaf(RuleField::Tracker, RuleOperator::NotEqual, json!("example.org")),
            &t,
            &ctx
        ));
        assert!(evaluate(
            &leaf(RuleField::Tracker, RuleOperator::NotEqual, json!("other.net")),
            &t,
            &ctx
        ));
    }

    #[test]
    fn test_state_bucket_with_raw_fallback() {
        let mut t = torrent("A", "a");
        t.state = "stalledUP".to_string();
        let ctx = EvalContext::default();

        assert!(evaluate(
            &leaf(RuleField::State, RuleOperator::Equal, json!("stalled")),
            &t,
            &ctx
        ));
        assert!(evaluate(
            &leaf(RuleField::State, RuleOperator::Equal, json!("stalledup")),
            &t,
            &ctx
        ));
        assert!(evaluate(
            &leaf(RuleField::State, RuleOperator::NotEqual, json!("errored")),
            &t,
            &ctx
        ));
    }

    #[test]
    fn test_group_short_circuit_and_negation() {
        let t = torrent("A", "Ubuntu ISO");
        let ctx = EvalContext::default();

        let and = Condition::and(vec![
            leaf(RuleField::Name, RuleOperator::Contains, json!("ubuntu")),
            leaf(RuleField::Name, RuleOperator::Contains, json!("iso")),
        ]);
        assert!(evaluate(&and, &t, &ctx));

        let or = Condition::or(vec![
            leaf(RuleField::Name, RuleOperator::Contains, json!("debian")),
            leaf(RuleField::Name, RuleOperator::Contains, json!("ubuntu")),
        ]);
        assert!(evaluate(&or, &t, &ctx));

        let negated = match Condition::and(vec![leaf(
            RuleField::Name,
            RuleOperator::Contains,
            json!("ubuntu"),
        )]) {
            Condition::Group(mut g) => {
                g.negate = true;
                Condition::Group(g)
            }
            c => c,
        };
        assert!(!evaluate(&negated, &t, &ctx));
    }

    #[test]
    fn test_depth_cap_evaluates_false() {
        let t = torrent("A", "a");
        let ctx = EvalContext::default();

        // Nest a tautology deeper than the cap
        let mut cond = leaf(RuleField::Hash, RuleOperator::Equal, json!("A"));
        assert!(evaluate(&cond, &t, &ctx));
        for _ in 0..MAX_DEPTH {
            cond = Condition::and(vec![cond]);
        }
        assert!(!evaluate(&cond, &t, &ctx));
    }

    #[test]
    fn test_hardlink_scope_requires_collector_data() {
        let t = torrent("A", "a");
        let rule = leaf(RuleField::HardlinkScope, RuleOperator::Equal, json!("none"));

        let ctx = EvalContext::default();
        assert!(!evaluate(&rule, &t, &ctx));

        let mut ctx = EvalContext {
            has_hardlink_data: true,
            ..Default::default()
        };
        ctx.hardlink_scope
            .insert("A".to_string(), HardlinkScope::None);
        assert!(evaluate(&rule, &t, &ctx));
    }

    #[test]
    fn test_free_space_reads_active_projection() {
        let mut t = torrent("A", "a");
        t.size = 100;
        let rule = leaf(
            RuleField::FreeSpace,
            RuleOperator::GreaterOrEqual,
            json!(1000),
        );

        // No projection source: never matches
        let ctx = EvalContext::default();
        assert!(!evaluate(&rule, &t, &ctx));

        let mut ctx = EvalContext::default();
        ctx.projections.switch_source("default", 950);
        assert!(!evaluate(&rule, &t, &ctx));

        ctx.projections.active_mut().unwrap().plan_delete(&t);
        assert!(evaluate(&rule, &t, &ctx));
    }

    #[test]
    fn test_private_flag() {
        let mut t = torrent("A", "a");
        t.is_private = true;
        let ctx = EvalContext::default();
        assert!(evaluate(
            &leaf(RuleField::Private, RuleOperator::Equal, json!(true)),
            &t,
            &ctx
        ));
        assert!(evaluate(
            &leaf(RuleField::Private, RuleOperator::NotEqual, json!(false)),
            &t,
            &ctx
        ));
    }

    #[test]
    fn test_unregistered_from_context_set() {
        let t = torrent("ABC", "a");
        let mut ctx = EvalContext::default();
        let rule = leaf(RuleField::IsUnregistered, RuleOperator::Equal, json!(true));
        assert!(!evaluate(&rule, &t, &ctx));
        ctx.unregistered.insert("ABC".to_string());
        assert!(evaluate(&rule, &t, &ctx));
    }
}
