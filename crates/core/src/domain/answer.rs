use serde::{Deserialize, Serialize};

use crate::chart::ChartSpec;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chart: Option<ChartSpec>,
}

impl Answer {
    pub fn new(text: impl Into<String>, chart: Option<ChartSpec>) -> Self {
        Self { text: text.into(), chart }
    }
}
