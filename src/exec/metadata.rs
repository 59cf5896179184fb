//! Step metadata handed to resource scripts

use serde::{Deserialize, Serialize};

/// Identity of the build a step belongs to
///
/// Rendered as `KEY=value` pairs in the resource script's environment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepMetadata {
    pub build_id: Option<u64>,
    pub build_name: Option<String>,
    pub job_name: Option<String>,
    pub pipeline_name: Option<String>,
    pub external_url: Option<String>,
}

impl StepMetadata {
    /// Environment pairs for the set fields, in a fixed order
    pub fn env(&self) -> Vec<String> {
        let mut env = Vec::new();

        if let Some(id) = self.build_id {
            env.push(format!("BUILD_ID={}", id));
        }
        if let Some(ref name) = self.build_name {
            env.push(format!("BUILD_NAME={}", name));
        }
        if let Some(ref job) = self.job_name {
            env.push(format!("BUILD_JOB_NAME={}", job));
        }
        if let Some(ref pipeline) = self.pipeline_name {
            env.push(format!("BUILD_PIPELINE_NAME={}", pipeline));
        }
        if let Some(ref url) = self.external_url {
            env.push(format!("ATC_EXTERNAL_URL={}", url));
        }

        env
    }

    /// Environment as key/value tuples
    pub fn env_pairs(&self) -> Vec<(String, String)> {
        self.env()
            .into_iter()
            .filter_map(|kv| {
                kv.split_once('=')
                    .map(|(k, v)| (k.to_string(), v.to_string()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_skips_unset_fields() {
        let metadata = StepMetadata {
            build_id: Some(42),
            job_name: Some("unit".to_string()),
            ..Default::default()
        };

        assert_eq!(metadata.env(), vec!["BUILD_ID=42", "BUILD_JOB_NAME=unit"]);
        assert!(StepMetadata::default().env().is_empty());
    }

    #[test]
    fn env_pairs_split_on_first_equals() {
        let metadata = StepMetadata {
            external_url: Some("https://ci.example.com/?a=b".to_string()),
            ..Default::default()
        };

        assert_eq!(
            metadata.env_pairs(),
            vec![(
                "ATC_EXTERNAL_URL".to_string(),
                "https://ci.example.com/?a=b".to_string()
            )]
        );
    }
}
