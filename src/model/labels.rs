//! ラベルセット（クラス名の順序付き集合）
//!
//! インデックスとクラス名の対応は学習・評価・推論で共通です。
//! 成果物（tar.gz）の metadata.json に保存され、読み込み時に照合されます。

use serde::{Deserialize, Serialize};

use crate::error::MangoError;

/// 既定の8クラス
pub const MANGO_LABELS: [&str; 8] = [
    "Anthracnose",
    "Bacterial Canker",
    "Cutting Weevil",
    "Die Back",
    "Gall Midge",
    "Healthy",
    "Powdery Mildew",
    "Sooty Mould",
];

/// 順序付きラベルセット
///
/// JSONではクラス名の配列として表現されます。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct LabelSet {
    labels: Vec<String>,
}

impl LabelSet {
    /// 空・重複を拒否して作成
    pub fn new(labels: Vec<String>) -> Result<Self, MangoError> {
        if labels.is_empty() {
            return Err(MangoError::config("label set is empty"));
        }
        for (i, label) in labels.iter().enumerate() {
            if label.trim().is_empty() {
                return Err(MangoError::config(format!("label #{} is blank", i)));
            }
            if labels[..i].contains(label) {
                return Err(MangoError::config(format!("duplicate label: {}", label)));
            }
        }
        Ok(Self { labels })
    }

    pub fn mango() -> Self {
        Self {
            labels: MANGO_LABELS.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn name(&self, index: usize) -> Option<&str> {
        self.labels.get(index).map(String::as_str)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.labels.iter().position(|l| l == name)
    }

    pub fn names(&self) -> &[String] {
        &self.labels
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.labels.iter().map(String::as_str)
    }

    /// 別のラベルセットと順序まで一致することを確認
    pub fn ensure_same(&self, other: &LabelSet) -> Result<(), MangoError> {
        if self == other {
            return Ok(());
        }
        Err(MangoError::config(format!(
            "label order mismatch: expected [{}], found [{}]",
            self.labels.join(", "),
            other.labels.join(", ")
        )))
    }
}

impl Default for LabelSet {
    fn default() -> Self {
        Self::mango()
    }
}

impl TryFrom<Vec<String>> for LabelSet {
    type Error = MangoError;

    fn try_from(labels: Vec<String>) -> Result<Self, Self::Error> {
        Self::new(labels)
    }
}

impl From<LabelSet> for Vec<String> {
    fn from(set: LabelSet) -> Self {
        set.labels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_order() {
        let labels = LabelSet::default();
        assert_eq!(labels.len(), 8);
        assert_eq!(labels.name(0), Some("Anthracnose"));
        assert_eq!(labels.name(7), Some("Sooty Mould"));
        assert_eq!(labels.index_of("Healthy"), Some(5));
        assert_eq!(labels.name(8), None);
    }

    #[test]
    fn test_rejects_duplicates_and_empty() {
        assert!(LabelSet::new(vec![]).is_err());
        assert!(LabelSet::new(vec!["a".into(), "b".into(), "a".into()]).is_err());
        assert!(LabelSet::new(vec!["a".into(), " ".into()]).is_err());
    }

    #[test]
    fn test_json_is_plain_list() {
        let labels = LabelSet::new(vec!["x".into(), "y".into()]).unwrap();
        let json = serde_json::to_string(&labels).unwrap();
        assert_eq!(json, r#"["x","y"]"#);

        let back: LabelSet = serde_json::from_str(&json).unwrap();
        assert_eq!(back, labels);
        assert!(serde_json::from_str::<LabelSet>(r#"["x","x"]"#).is_err());
    }

    #[test]
    fn test_order_mismatch_is_reported() {
        let a = LabelSet::new(vec!["x".into(), "y".into()]).unwrap();
        let b = LabelSet::new(vec!["y".into(), "x".into()]).unwrap();
        assert!(a.ensure_same(&a.clone()).is_ok());
        assert!(matches!(a.ensure_same(&b), Err(MangoError::Config(_))));
    }
}
