//! Image references and the image → (resource class, job type) table.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{JobType, ResourceClass};

/// Docker tag grammar; the tag doubles as an artifact identifier.
static TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.-]{0,127}$").unwrap());

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ImageRefError {
    #[error("image reference must look like registry/repo:tag: {0}")]
    InvalidFormat(String),

    #[error("image tag is not a valid artifact identifier: {0}")]
    InvalidTag(String),

    #[error("job type (training/inference) not stated in image repository: {0}")]
    MissingJobType(String),

    #[error("no resource class rule matches image: {0}")]
    NoMatchingRule(String),
}

/// Parsed `{registry}/{repository}:{tag}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub registry: String,
    pub repository: String,
    pub tag: String,
}

impl ImageRef {
    pub fn parse(image: &str) -> Result<Self, ImageRefError> {
        let invalid = || ImageRefError::InvalidFormat(image.to_string());

        if image.contains('@') || image.chars().any(char::is_whitespace) {
            return Err(invalid());
        }
        let (registry, rest) = image.split_once('/').ok_or_else(invalid)?;
        // The tag separator is the last ':' after the last '/', so registry
        // ports (`host:5000/...`) never reach this split.
        let (repository, tag) = rest.rsplit_once(':').ok_or_else(invalid)?;
        if registry.is_empty() || repository.is_empty() || repository.ends_with('/') {
            return Err(invalid());
        }
        if !TAG_RE.is_match(tag) {
            return Err(ImageRefError::InvalidTag(tag.to_string()));
        }

        Ok(Self {
            registry: registry.to_string(),
            repository: repository.to_string(),
            tag: tag.to_string(),
        })
    }

    /// Job type stated in the repository name.
    pub fn job_type(&self) -> Result<JobType, ImageRefError> {
        if self.repository.contains("training") {
            Ok(JobType::Training)
        } else if self.repository.contains("inference") {
            Ok(JobType::Inference)
        } else {
            Err(ImageRefError::MissingJobType(self.to_string()))
        }
    }

    pub fn device(&self) -> Device {
        if self.tag.contains("gpu") {
            Device::Gpu
        } else {
            Device::Cpu
        }
    }
}

impl std::fmt::Display for ImageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}:{}", self.registry, self.repository, self.tag)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    Cpu,
    Gpu,
}

/// One row of the resource-class table. Unset fields match anything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRule {
    /// Substring of the repository, e.g. `tensorflow`.
    #[serde(default)]
    pub framework: Option<String>,
    #[serde(default)]
    pub job_type: Option<JobType>,
    #[serde(default)]
    pub device: Option<Device>,
    pub resource_class: ResourceClass,
}

impl ImageRule {
    fn matches(&self, image: &ImageRef, job_type: JobType) -> bool {
        self.framework
            .as_deref()
            .is_none_or(|fw| image.repository.contains(fw))
            && self.job_type.is_none_or(|jt| jt == job_type)
            && self.device.is_none_or(|d| d == image.device())
    }
}

/// Where a ticket for an image must run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub resource_class: ResourceClass,
    pub job_type: JobType,
}

/// Ordered, first-match-wins mapping from images to resource classes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceClassTable {
    rules: Vec<ImageRule>,
}

impl ResourceClassTable {
    pub fn new(rules: Vec<ImageRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[ImageRule] {
        &self.rules
    }

    /// Resolve the placement of an image. Pure and deterministic.
    pub fn classify(&self, image: &ImageRef) -> Result<Placement, ImageRefError> {
        let job_type = image.job_type()?;
        self.rules
            .iter()
            .find(|rule| rule.matches(image, job_type))
            .map(|rule| Placement {
                resource_class: rule.resource_class.clone(),
                job_type,
            })
            .ok_or_else(|| ImageRefError::NoMatchingRule(image.to_string()))
    }
}

impl Default for ResourceClassTable {
    /// SageMaker instance types historically used for each framework.
    fn default() -> Self {
        let rule = |framework: Option<&str>, device, class: &str| ImageRule {
            framework: framework.map(str::to_string),
            job_type: None,
            device: Some(device),
            resource_class: class.to_string(),
        };
        Self::new(vec![
            rule(Some("tensorflow"), Device::Gpu, "ml.p3.8xlarge"),
            rule(Some("tensorflow"), Device::Cpu, "ml.c4.4xlarge"),
            rule(None, Device::Gpu, "ml.p2.8xlarge"),
            rule(None, Device::Cpu, "ml.c4.8xlarge"),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TF_GPU: &str =
        "763104351884.dkr.ecr.us-west-2.amazonaws.com/tensorflow-training:2.2.0-gpu-py37-cu101-ubuntu18.04";

    #[test]
    fn parse_registry_repo_tag() {
        let image = ImageRef::parse(TF_GPU).unwrap();
        assert_eq!(image.registry, "763104351884.dkr.ecr.us-west-2.amazonaws.com");
        assert_eq!(image.repository, "tensorflow-training");
        assert_eq!(image.tag, "2.2.0-gpu-py37-cu101-ubuntu18.04");
        assert_eq!(image.to_string(), TF_GPU);
    }

    #[test]
    fn parse_registry_with_port_and_nested_repo() {
        let image = ImageRef::parse("localhost:5000/dlc/pytorch-inference:1.0-cpu").unwrap();
        assert_eq!(image.registry, "localhost:5000");
        assert_eq!(image.repository, "dlc/pytorch-inference");
        assert_eq!(image.tag, "1.0-cpu");
    }

    #[test]
    fn parse_rejects_malformed_refs() {
        assert!(matches!(
            ImageRef::parse("tensorflow-training:2.2"),
            Err(ImageRefError::InvalidFormat(_))
        ));
        assert!(matches!(
            ImageRef::parse("reg/tensorflow-training"),
            Err(ImageRefError::InvalidFormat(_))
        ));
        assert!(matches!(
            ImageRef::parse("reg/repo@sha256:abc"),
            Err(ImageRefError::InvalidFormat(_))
        ));
        assert!(matches!(
            ImageRef::parse("reg/repo:-bad"),
            Err(ImageRefError::InvalidTag(_))
        ));
    }

    #[test]
    fn default_table_matches_historic_instance_types() {
        let table = ResourceClassTable::default();
        let classify = |s: &str| table.classify(&ImageRef::parse(s).unwrap()).unwrap();

        let p = classify(TF_GPU);
        assert_eq!(p.resource_class, "ml.p3.8xlarge");
        assert_eq!(p.job_type, JobType::Training);

        assert_eq!(
            classify("r/tensorflow-inference:2.3-cpu-py37").resource_class,
            "ml.c4.4xlarge"
        );
        assert_eq!(classify("r/mxnet-training:1.8-gpu").resource_class, "ml.p2.8xlarge");
        let p = classify("r/pytorch-inference:1.6-cpu");
        assert_eq!(p.resource_class, "ml.c4.8xlarge");
        assert_eq!(p.job_type, JobType::Inference);
    }

    #[test]
    fn classify_requires_job_type() {
        let table = ResourceClassTable::default();
        let image = ImageRef::parse("r/pytorch-base:1.0-gpu").unwrap();
        assert!(matches!(
            table.classify(&image),
            Err(ImageRefError::MissingJobType(_))
        ));
    }

    #[test]
    fn first_matching_rule_wins() {
        let table = ResourceClassTable::new(vec![
            ImageRule {
                framework: Some("pytorch".to_string()),
                job_type: Some(JobType::Inference),
                device: None,
                resource_class: "inf-class".to_string(),
            },
            ImageRule {
                framework: Some("pytorch".to_string()),
                job_type: None,
                device: None,
                resource_class: "any-pytorch".to_string(),
            },
        ]);
        let infer = ImageRef::parse("r/pytorch-inference:1-gpu").unwrap();
        let train = ImageRef::parse("r/pytorch-training:1-gpu").unwrap();
        let tf = ImageRef::parse("r/tensorflow-training:1-gpu").unwrap();
        assert_eq!(table.classify(&infer).unwrap().resource_class, "inf-class");
        assert_eq!(table.classify(&train).unwrap().resource_class, "any-pytorch");
        assert!(matches!(
            table.classify(&tf),
            Err(ImageRefError::NoMatchingRule(_))
        ));
    }
}
