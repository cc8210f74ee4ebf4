//! Plugin synthesis: close a capability gap by generating a candidate
//! from a template, validating it, running its declared test cases in
//! the sandbox, refining on failure, and registering on success.

use semver::Version;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::domain::errors::RuntimeResult;
use crate::domain::models::capability::{
    CapabilityGap, GapStatus, SynthesisRequirement, SynthesisTestCase,
};
use crate::domain::models::config::SynthesisConfig;
use crate::domain::models::plugin::PluginMetadata;
use crate::domain::ports::{Caller, PluginHandle};
use crate::infrastructure::storage::{self, DataDir};
use crate::services::registry::PluginRegistry;
use crate::services::sandbox::SandboxExecutor;
use crate::services::templates::TemplateLibrary;
use crate::services::transform::{TransformPlugin, TransformSpec, TRANSFORM_SOURCE_FILE};

/// Default per-case test timeout.
const DEFAULT_CASE_TIMEOUT: Duration = Duration::from_secs(10);

/// Severity of a validation finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    High,
    Medium,
    Low,
}

/// One banned-construct hit in generated source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationFinding {
    pub severity: Severity,
    pub pattern: String,
    /// Capability that whitelists this finding, for medium severity
    pub requires_capability: Option<String>,
}

/// Why synthesis failed.
#[derive(Debug, Clone)]
pub enum SynthesisError {
    /// No template scored above zero for the requirement
    NoTemplate,
    /// Generated source tripped fatal or unwhitelisted findings
    ValidationFailed(Vec<ValidationFinding>),
    /// Cases still failing after the final iteration, by index
    TestFailed(Vec<usize>),
    /// Every refinement iteration was consumed
    RefinementExhausted,
    /// The registry refused the candidate
    RegistryReject(String),
    /// Sandbox or storage failure outside the candidate's control
    Internal(String),
}

impl std::fmt::Display for SynthesisError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoTemplate => write!(f, "no template matches the requirement"),
            Self::ValidationFailed(findings) => {
                write!(f, "validation failed with {} findings", findings.len())
            }
            Self::TestFailed(cases) => write!(f, "test cases failed: {cases:?}"),
            Self::RefinementExhausted => write!(f, "refinement iterations exhausted"),
            Self::RegistryReject(reason) => write!(f, "registry rejected candidate: {reason}"),
            Self::Internal(message) => write!(f, "synthesis internal error: {message}"),
        }
    }
}

/// Per-case result from a candidate test run.
#[derive(Debug, Clone)]
pub struct CaseResult {
    pub index: usize,
    pub passed: bool,
    pub duration_ms: u64,
    pub error: Option<String>,
}

/// Plugin synthesis pipeline.
pub struct PluginSynthesizer {
    config: SynthesisConfig,
    templates: TemplateLibrary,
    registry: Arc<PluginRegistry>,
    sandbox: Arc<SandboxExecutor>,
    data_dir: DataDir,
    /// Requirement signature -> registered plugin id
    cache: RwLock<HashMap<String, String>>,
    /// Bounds concurrent template fills
    workers: Arc<Semaphore>,
    /// Register native handles instead of runner subprocesses; used by
    /// embedded deployments and tests
    in_process_candidates: bool,
}

impl PluginSynthesizer {
    pub fn new(
        config: SynthesisConfig,
        registry: Arc<PluginRegistry>,
        sandbox: Arc<SandboxExecutor>,
        data_dir: DataDir,
    ) -> Self {
        let workers = Arc::new(Semaphore::new(config.worker_pool.max(1)));
        Self {
            config,
            templates: TemplateLibrary::builtin(),
            registry,
            sandbox,
            data_dir,
            cache: RwLock::new(HashMap::new()),
            workers,
            in_process_candidates: false,
        }
    }

    /// Test and register candidates in-process rather than through the
    /// runner subprocess.
    pub fn with_in_process_candidates(mut self) -> Self {
        self.in_process_candidates = true;
        self
    }

    /// Drive a capability gap to a terminal status. Returns the
    /// registered plugin id on success.
    pub async fn process_gap(&self, gap: &mut CapabilityGap) -> Result<String, SynthesisError> {
        gap.set_status(GapStatus::Composing);
        match self.synthesize(&gap.requirement).await {
            Ok(plugin_id) => {
                gap.plugin_id = Some(plugin_id.clone());
                gap.set_status(GapStatus::Registered);
                Ok(plugin_id)
            }
            Err(err) => {
                gap.error = Some(err.to_string());
                gap.set_status(GapStatus::Failed);
                Err(err)
            }
        }
    }

    /// Synthesize a plugin for a requirement.
    #[instrument(skip(self, requirement), fields(capability = %requirement.capability), err(Display))]
    pub async fn synthesize(
        &self,
        requirement: &SynthesisRequirement,
    ) -> Result<String, SynthesisError> {
        // Identical requirements short-circuit to the cached plugin.
        let signature = requirement.signature();
        if let Some(cached) = self.cache.read().await.get(&signature) {
            info!(plugin_id = %cached, "Synthesis cache hit");
            return Ok(cached.clone());
        }

        let _worker = self
            .workers
            .acquire()
            .await
            .map_err(|_| SynthesisError::Internal("worker pool closed".to_string()))?;

        // 1. Template match.
        let template = self
            .templates
            .best_match(requirement)
            .ok_or(SynthesisError::NoTemplate)?;
        info!(template = template.id, "Template selected");

        // Refinement loop: each iteration derives a (hopefully better)
        // transform, re-validates, and re-tests.
        let mut last_failures: Vec<usize> = Vec::new();
        for iteration in 0..=self.config.max_refinement_iterations {
            let Some(spec) = derive_spec(&requirement.test_cases, iteration) else {
                continue;
            };

            // 2. Fill.
            let name = plugin_name(&requirement.capability);
            let transform_json = spec
                .to_source()
                .map_err(|e| SynthesisError::Internal(e.to_string()))?;
            let source = template.fill(&[
                ("name", name.clone()),
                ("description", requirement.description.clone()),
                ("capability", requirement.capability.clone()),
                ("transform", transform_json),
            ]);

            // 3. Validate.
            let findings = validate_source(&source);
            let fatal: Vec<ValidationFinding> = findings
                .iter()
                .filter(|f| match f.severity {
                    Severity::High => true,
                    Severity::Medium => f
                        .requires_capability
                        .as_ref()
                        .is_none_or(|cap| !requirement.allowed_capabilities.contains(cap)),
                    Severity::Low => false,
                })
                .cloned()
                .collect();
            if !fatal.is_empty() {
                return Err(SynthesisError::ValidationFailed(fatal));
            }

            // 4. Materialize into the plugin store scratch area.
            let version = self.registry.next_version(&name).await;
            let candidate = self
                .materialize(requirement, &name, &version, &source)
                .await
                .map_err(|e| SynthesisError::Internal(e.to_string()))?;

            // 5. Test every declared case through the sandbox.
            let results = self.run_cases(requirement, &candidate).await;
            let failures: Vec<usize> = results
                .iter()
                .filter(|r| !r.passed)
                .map(|r| r.index)
                .collect();

            if failures.is_empty() {
                // 7. Register.
                let plugin_id = self
                    .registry
                    .register(candidate.metadata.clone(), candidate.handle.clone())
                    .await
                    .map_err(|e| SynthesisError::RegistryReject(e.to_string()))?;
                self.cache
                    .write()
                    .await
                    .insert(signature, plugin_id.clone());
                info!(plugin_id = %plugin_id, iteration, "Candidate registered");
                return Ok(plugin_id);
            }

            // 6. Refine: next iteration widens the fit.
            warn!(
                iteration,
                failing = failures.len(),
                "Candidate failed cases, refining"
            );
            last_failures = failures;
        }

        if last_failures.is_empty() {
            Err(SynthesisError::RefinementExhausted)
        } else {
            Err(SynthesisError::TestFailed(last_failures))
        }
    }

    async fn materialize(
        &self,
        requirement: &SynthesisRequirement,
        name: &str,
        version: &Version,
        source: &str,
    ) -> RuntimeResult<Candidate> {
        let mut metadata = PluginMetadata::new(name, version.clone());
        metadata.description = requirement.description.clone();
        metadata.author = "panion-synthesizer".to_string();
        metadata.capabilities = requirement
            .required_skills
            .iter()
            .cloned()
            .chain(std::iter::once(requirement.capability.clone()))
            .collect::<BTreeSet<String>>();
        metadata.content_hash = {
            use sha2::{Digest, Sha256};
            hex::encode(Sha256::digest(source.as_bytes()))
        };

        let cases = serde_json::to_value(&requirement.test_cases)?;
        let plugin_dir = storage::write_plugin(
            &self.data_dir,
            &metadata,
            TRANSFORM_SOURCE_FILE,
            source,
            &cases,
        )?;

        let handle = if self.in_process_candidates {
            PluginHandle::Native(Arc::new(TransformPlugin::load(&plugin_dir)?))
        } else {
            PluginHandle::Command {
                program: self.sandbox.default_runner(),
                args: Vec::new(),
                plugin_dir: plugin_dir.clone(),
            }
        };

        Ok(Candidate { metadata, handle })
    }

    async fn run_cases(
        &self,
        requirement: &SynthesisRequirement,
        candidate: &Candidate,
    ) -> Vec<CaseResult> {
        let mut results = Vec::with_capacity(requirement.test_cases.len());
        for (index, case) in requirement.test_cases.iter().enumerate() {
            let timeout = case
                .timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_CASE_TIMEOUT);
            let outcome = self
                .sandbox
                .execute_handle(
                    &candidate.metadata.id(),
                    &candidate.handle,
                    candidate.metadata.resource_limits,
                    case.input.clone(),
                    timeout,
                    Caller::Synthesizer,
                    CancellationToken::new(),
                )
                .await;

            let result = match outcome {
                Ok(run) => CaseResult {
                    index,
                    passed: deep_matches(&case.expected, &run.output),
                    duration_ms: run.duration_ms,
                    error: None,
                },
                Err(err) => CaseResult {
                    index,
                    passed: false,
                    duration_ms: 0,
                    error: Some(err.to_string()),
                },
            };
            results.push(result);
        }
        results
    }
}

struct Candidate {
    metadata: PluginMetadata,
    handle: PluginHandle,
}

/// Derive the transform for one refinement iteration: the first fit uses
/// the leading examples, later iterations widen to the full set and then
/// to fallback strategies.
fn derive_spec(cases: &[SynthesisTestCase], iteration: u32) -> Option<TransformSpec> {
    match iteration {
        0 => {
            let head = &cases[..cases.len().min(2)];
            TransformSpec::fit(head)
        }
        1 => TransformSpec::fit(cases),
        _ => TransformSpec::fit(cases).or(Some(TransformSpec::Identity)),
    }
}

/// Deterministic plugin name from a capability tag.
fn plugin_name(capability: &str) -> String {
    let cleaned: String = capability
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    format!("gen-{}", cleaned.trim_matches('-'))
}

/// Banned constructs, severity-ranked. High findings are fatal; medium
/// findings need the requirement to whitelist a capability.
fn validate_source(source: &str) -> Vec<ValidationFinding> {
    struct Rule {
        pattern: &'static str,
        severity: Severity,
        requires_capability: Option<&'static str>,
    }
    const RULES: &[Rule] = &[
        Rule { pattern: r"\beval\s*\(", severity: Severity::High, requires_capability: None },
        Rule { pattern: r"\bexec\s*\(", severity: Severity::High, requires_capability: None },
        Rule { pattern: r"\bsystem\s*\(", severity: Severity::High, requires_capability: None },
        Rule { pattern: r"subprocess|child_process|popen", severity: Severity::High, requires_capability: None },
        Rule { pattern: r"__import__|importlib", severity: Severity::High, requires_capability: None },
        Rule { pattern: r"\bopen\s*\(|readFile|writeFile", severity: Severity::Medium, requires_capability: Some("fs") },
        Rule { pattern: r"\bsocket\b|\bconnect\s*\(|http://|https://", severity: Severity::Medium, requires_capability: Some("net") },
    ];

    let mut findings = Vec::new();
    for rule in RULES {
        let Ok(re) = regex::Regex::new(rule.pattern) else {
            continue;
        };
        if re.is_match(source) {
            findings.push(ValidationFinding {
                severity: rule.severity,
                pattern: rule.pattern.to_string(),
                requires_capability: rule.requires_capability.map(str::to_string),
            });
        }
    }
    findings
}

/// Structural equality for case outputs: objects require every expected
/// key present and matching, arrays require the same length pairwise,
/// everything else compares directly.
fn deep_matches(expected: &serde_json::Value, actual: &serde_json::Value) -> bool {
    use serde_json::Value;
    match (expected, actual) {
        (Value::Object(want), Value::Object(have)) => want
            .iter()
            .all(|(key, value)| have.get(key).is_some_and(|v| deep_matches(value, v))),
        (Value::Array(want), Value::Array(have)) => {
            want.len() == have.len()
                && want.iter().zip(have.iter()).all(|(w, h)| deep_matches(w, h))
        }
        (want, have) => want == have,
    }
}
