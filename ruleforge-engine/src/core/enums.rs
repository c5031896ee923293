use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// 规则类型枚举，对应编译产物中的 `type` 字段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    Query,
    Eql,
    Esql,
    Threshold,
    NewTerms,
    ThreatMatch,
    MachineLearning,
}

impl RuleType {
    pub const ALL: [RuleType; 7] = [
        RuleType::Query,
        RuleType::Eql,
        RuleType::Esql,
        RuleType::Threshold,
        RuleType::NewTerms,
        RuleType::ThreatMatch,
        RuleType::MachineLearning,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RuleType::Query => "query",
            RuleType::Eql => "eql",
            RuleType::Esql => "esql",
            RuleType::Threshold => "threshold",
            RuleType::NewTerms => "new_terms",
            RuleType::ThreatMatch => "threat_match",
            RuleType::MachineLearning => "machine_learning",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == raw)
    }

    /// 是否携带查询语句
    pub fn is_query_bearing(&self) -> bool {
        !matches!(self, RuleType::MachineLearning)
    }
}

impl Display for RuleType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 查询语言
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryLanguage {
    Kuery,
    Lucene,
    Eql,
    Esql,
}

impl QueryLanguage {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryLanguage::Kuery => "kuery",
            QueryLanguage::Lucene => "lucene",
            QueryLanguage::Eql => "eql",
            QueryLanguage::Esql => "esql",
        }
    }
}

impl Display for QueryLanguage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 规则成熟度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Maturity {
    #[default]
    Development,
    Experimental,
    Beta,
    Production,
    Deprecated,
}
