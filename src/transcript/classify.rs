//! Heuristic message classification.
//!
//! A server-supplied category always wins. Legacy entries without one are
//! matched against an ordered rule table; the first matching rule decides.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::lifecycle::types::TaskType;
use crate::transcript::message::{Category, Message};

/// Content markers of an optimization log.
pub const OPTIMIZE_KEYWORDS: &[&str] = &[
    "开始优化",
    "发送参数",
    "优化完成",
    "优化结果详细信息",
    "optimization started",
    "sending parameters",
    "optimization complete",
];

/// Alt labels of the charts attached to optimization results.
pub const CHART_LABELS: &[&str] = &[
    "收敛曲线",
    "参数分布图",
    "convergence curve",
    "parameter distribution",
];

/// Metadata keys that reference generated code or model files.
pub const GEOMETRY_METADATA_KEYS: &[&str] = &["code_file", "cad_file", "stl_file", "preview_image"];

/// Code fences of the modeling languages.
pub const GEOMETRY_FENCES: &[&str] = &["```py", "```cadquery", "```openscad", "```scad"];

struct Rule {
    name: &'static str,
    category: Category,
    matches: fn(&Message, &str) -> bool,
}

const RULES: &[Rule] = &[
    Rule {
        name: "optimize_markers",
        category: Category::Optimize,
        matches: has_optimize_markers,
    },
    Rule {
        name: "geometry_markers",
        category: Category::Geometry,
        matches: has_geometry_markers,
    },
];

/// Category of `message`. Pure and total.
#[must_use]
pub fn classify(message: &Message) -> Category {
    if let Some(category) = message.category.filter(|category| *category != Category::General) {
        return category;
    }

    let content = message.content.to_lowercase();
    RULES
        .iter()
        .find(|rule| (rule.matches)(message, &content))
        .map_or(Category::General, |rule| {
            debug!(rule = rule.name, id = %message.id, "message classified");
            rule.category
        })
}

fn has_optimize_markers(message: &Message, content: &str) -> bool {
    message.task_type == Some(TaskType::Optimize)
        || message.metadata_str("task_type") == Some(TaskType::Optimize.as_str())
        || OPTIMIZE_KEYWORDS.iter().any(|keyword| content.contains(keyword))
        || message.images().any(|image| {
            let label = image.alt_label.to_lowercase();
            CHART_LABELS.iter().any(|chart| label.contains(chart))
        })
}

fn has_geometry_markers(message: &Message, content: &str) -> bool {
    GEOMETRY_METADATA_KEYS.iter().any(|key| {
        message.metadata.get(*key).is_some_and(|value| match value {
            Value::Null => false,
            Value::String(text) => !text.is_empty(),
            _ => true,
        })
    }) || GEOMETRY_FENCES.iter().any(|fence| content.contains(fence))
}

/// One tunable parameter announced by an optimization run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParameterRange {
    /// Parameter name as reported by the backend.
    pub name: String,
    /// Lower bound.
    pub min: f64,
    /// Upper bound.
    pub max: f64,
    /// Suggested starting value, the midpoint of the range.
    pub initial: f64,
}

/// Parses `获取参数N：name：[min, max]` lines (and the English
/// `Parameter N: name: [min, max]` form) out of an optimization answer.
#[derive(Debug, Clone)]
pub struct ParameterExtractor {
    pattern: Regex,
}

impl ParameterExtractor {
    /// Compile the line pattern.
    ///
    /// # Errors
    /// Returns an error if the pattern is invalid.
    pub fn new() -> Result<Self, regex::Error> {
        let number = r"[-+]?\d+(?:\.\d+)?(?:[eE][-+]?\d+)?";
        let pattern = Regex::new(&format!(
            r"(?m)(?:获取(?:到)?参数|(?i:parameter)\s*)\d+\s*[:：]\s*([^\n:：\[]+?)\s*[:：]\s*\[\s*({number})\s*,\s*({number})\s*\]"
        ))?;
        Ok(Self { pattern })
    }

    /// All parameter ranges in `answer`, in order of appearance.
    #[must_use]
    pub fn extract(&self, answer: &str) -> Vec<ParameterRange> {
        self.pattern
            .captures_iter(answer)
            .filter_map(|caps| {
                let name = caps.get(1)?.as_str().trim().to_string();
                let min = caps.get(2)?.as_str().parse::<f64>().ok()?;
                let max = caps.get(3)?.as_str().parse::<f64>().ok()?;
                Some(ParameterRange {
                    name,
                    min,
                    max,
                    initial: (min + max) / 2.0,
                })
            })
            .collect()
    }
}

static PARAMETERS: LazyLock<Option<ParameterExtractor>> =
    LazyLock::new(|| ParameterExtractor::new().ok());

/// Parameter ranges announced in a finalized optimization answer.
#[must_use]
pub fn extract_parameter_ranges(answer: &str) -> Vec<ParameterRange> {
    PARAMETERS
        .as_ref()
        .map(|extractor| extractor.extract(answer))
        .unwrap_or_default()
}
