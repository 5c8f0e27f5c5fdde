/*!
 * Device detection.
 *
 * Every communication type enumerates its reachable addresses. For each address
 * that is not already known, candidate models of that communication type are
 * tried in registration order; the first whose whole predicate chain holds is
 * assigned. Query responses are computed lazily and memoised per address, so a
 * cheap query ordered first spares the expensive ones and no query runs twice.
 * One address failing never stops the scan of the others.
 */
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, warn, Instrument};

use testrig_core::config::{DetectionConfig, SwitchboardConfig};
use testrig_core::logging::operation_span;
use testrig_core::types::DeviceConfig;
use testrig_core::utils::with_timeout;
use testrig_switchboard::{EventParser, Switchboard};

use crate::communication::CommunicationType;
use crate::error::{DeviceError, Result};
use crate::extension::DeviceModelDescriptor;
use crate::records::{DeviceRecord, NAME, SERIAL_NUMBER};
use crate::registry::ExtensionRegistry;

/// Name of the query every communication type answers with `true`
pub const ALWAYS_TRUE: &str = "always_true";

/// Answer to a detection query
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum QueryResponse {
    /// Yes/no answer
    Flag(bool),
    /// Text answer; also used for errors and timeouts
    Text(String),
}

/// Memoised responses for one address, keyed by query name
pub type QueryResponses = BTreeMap<String, QueryResponse>;

/// Condition on one query response
#[derive(Debug, Clone)]
pub enum MatchCriterion {
    /// A flag response must equal this value
    Equals(bool),
    /// A text response must contain a match
    Matches(Regex),
}

impl MatchCriterion {
    /// Criterion matching text responses against `pattern`
    pub fn matches(pattern: &str) -> Result<Self> {
        Regex::new(pattern)
            .map(MatchCriterion::Matches)
            .map_err(|e| DeviceError::detection(format!("invalid criterion {:?}: {}", pattern, e)))
    }

    /// Whether `response` satisfies the criterion
    pub fn is_satisfied_by(&self, response: &QueryResponse) -> bool {
        match (self, response) {
            (MatchCriterion::Equals(expected), QueryResponse::Flag(actual)) => expected == actual,
            (MatchCriterion::Matches(pattern), QueryResponse::Text(text)) => pattern.is_match(text),
            _ => false,
        }
    }
}

/// What a query gets to inspect one candidate address
#[derive(Debug, Clone)]
pub struct DetectContext {
    address: String,
    communication: Arc<dyn CommunicationType>,
    log_path: PathBuf,
    switchboard: SwitchboardConfig,
}

impl DetectContext {
    /// Context for `address` on `communication`
    pub fn new<A: Into<String>>(
        address: A,
        communication: Arc<dyn CommunicationType>,
        log_path: PathBuf,
        switchboard: SwitchboardConfig,
    ) -> Self {
        Self {
            address: address.into(),
            communication,
            log_path,
            switchboard,
        }
    }

    /// The candidate address
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Name of the communication type
    pub fn communication_type(&self) -> &str {
        self.communication.name()
    }

    /// Where device interaction during detection is logged
    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Open a switchboard on the candidate; the caller closes it
    pub async fn open_switchboard(&self) -> Result<Switchboard> {
        let transport = self.communication.transport(&self.address)?;
        let options = self
            .communication
            .switchboard_options(self.log_path.clone(), &self.switchboard)?;
        let parser = Arc::new(EventParser::new(self.address.clone()));
        let switchboard = Switchboard::new(self.address.clone(), transport, parser, options);
        switchboard.open().await?;
        Ok(switchboard)
    }
}

/// A named question asked of a candidate address
#[async_trait]
pub trait DetectQuery: Send + Sync + Debug {
    /// Query name, unique per communication type
    fn name(&self) -> &str;

    /// Ask the question
    async fn query(&self, context: &DetectContext) -> anyhow::Result<QueryResponse>;
}

/// Produces the persistent identifiers of a detected device
///
/// Returned properties override the default identity. Overriding
/// `serial_number` without `name` renames the device accordingly.
#[async_trait]
pub trait Identify: Send + Sync + Debug {
    /// Identify the device at the context's address
    async fn identify(
        &self,
        model: &DeviceModelDescriptor,
        context: &DetectContext,
        responses: &QueryResponses,
    ) -> anyhow::Result<DeviceConfig>;
}

/// Answers `true` for every address
#[derive(Debug, Clone, Default)]
pub struct AlwaysTrue;

#[async_trait]
impl DetectQuery for AlwaysTrue {
    fn name(&self) -> &str {
        ALWAYS_TRUE
    }

    async fn query(&self, _context: &DetectContext) -> anyhow::Result<QueryResponse> {
        Ok(QueryResponse::Flag(true))
    }
}

/// Whether the address exists as a filesystem path
#[derive(Debug, Clone)]
pub struct PathExists {
    name: String,
}

impl PathExists {
    /// Query called `name`
    pub fn new<N: Into<String>>(name: N) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl DetectQuery for PathExists {
    fn name(&self) -> &str {
        &self.name
    }

    async fn query(&self, context: &DetectContext) -> anyhow::Result<QueryResponse> {
        Ok(QueryResponse::Flag(tokio::fs::metadata(context.address()).await.is_ok()))
    }
}

/// The program name of a process address (first word, without directories)
#[derive(Debug, Clone)]
pub struct ProgramName {
    name: String,
}

impl ProgramName {
    /// Query called `name`
    pub fn new<N: Into<String>>(name: N) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl DetectQuery for ProgramName {
    fn name(&self) -> &str {
        &self.name
    }

    async fn query(&self, context: &DetectContext) -> anyhow::Result<QueryResponse> {
        let program = context.address().split_whitespace().next().unwrap_or_default();
        let base = Path::new(program)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(QueryResponse::Text(base))
    }
}

/// Sends a command over a switchboard and returns the response
///
/// The first capture group of `pattern` is returned when present, otherwise the
/// whole matching line.
#[derive(Debug, Clone)]
pub struct CommandQuery {
    name: String,
    command: String,
    pattern: Regex,
    timeout: Duration,
}

impl CommandQuery {
    /// Query called `name` sending `command`
    pub fn new<N: Into<String>, C: Into<String>>(name: N, command: C, pattern: &str) -> Result<Self> {
        let pattern = Regex::new(pattern)
            .map_err(|e| DeviceError::detection(format!("invalid response pattern {:?}: {}", pattern, e)))?;
        Ok(Self {
            name: name.into(),
            command: command.into(),
            pattern,
            timeout: Duration::from_secs(5),
        })
    }

    /// Override the response timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl DetectQuery for CommandQuery {
    fn name(&self) -> &str {
        &self.name
    }

    async fn query(&self, context: &DetectContext) -> anyhow::Result<QueryResponse> {
        let switchboard = context.open_switchboard().await?;
        let response = switchboard
            .send_and_expect(format!("{}\n", self.command), &[self.pattern.as_str()], self.timeout)
            .await;
        let closed = switchboard.close().await;
        let response = response?;
        closed?;

        if response.timed_out {
            anyhow::bail!("no response to {:?} within {:?}", self.command, self.timeout);
        }
        let line = response.line.unwrap_or_default();
        let value = self
            .pattern
            .captures(&line)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .unwrap_or(line);
        Ok(QueryResponse::Text(value.trim().to_string()))
    }
}

/// Serial number derived from an address: its alphanumeric characters, at least four
pub fn derive_serial_number(address: &str) -> String {
    let serial: String = address.chars().filter(char::is_ascii_alphanumeric).collect();
    format!("{:0>4}", serial)
}

/// `<model>-<last four characters of the serial>`, lower case
pub fn device_name(model: &str, serial_number: &str) -> String {
    let chars: Vec<char> = serial_number.chars().collect();
    let suffix: String = chars[chars.len().saturating_sub(4)..].iter().collect();
    format!("{}-{:0>4}", model, suffix).to_lowercase()
}

/// The identity every detected device starts from
pub fn default_identity(model: &DeviceModelDescriptor, address: &str) -> DeviceRecord {
    let serial = derive_serial_number(address);
    let name = device_name(&model.id, &serial);
    let mut record = DeviceRecord::new(&name, &model.id, &model.communication_type, address, &serial);
    record.optional = model.properties.optional.clone();
    record
}

/// An address no model claimed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnknownAddress {
    /// Communication type the address was found on
    pub communication_type: String,
    /// The address
    pub address: String,
}

/// Something that went wrong during a scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DetectionFailure {
    /// Communication type involved
    pub communication_type: String,
    /// Address involved; `None` when enumeration itself failed
    pub address: Option<String>,
    /// The failure description
    pub reason: String,
}

/// Outcome of one detection pass
#[derive(Debug, Clone, Default, Serialize)]
pub struct DetectionReport {
    /// Newly classified devices
    pub detected: Vec<DeviceRecord>,
    /// Addresses no model matched
    pub unknown: Vec<UnknownAddress>,
    /// Enumeration and per-address failures
    pub errors: Vec<DetectionFailure>,
}

impl DetectionReport {
    /// Whether the pass found nothing at all
    pub fn is_empty(&self) -> bool {
        self.detected.is_empty() && self.unknown.is_empty() && self.errors.is_empty()
    }
}

struct QueryCache<'a> {
    context: &'a DetectContext,
    queries: &'a [Arc<dyn DetectQuery>],
    timeout: Duration,
    responses: QueryResponses,
}

impl<'a> QueryCache<'a> {
    fn new(context: &'a DetectContext, queries: &'a [Arc<dyn DetectQuery>], timeout: Duration) -> Self {
        Self {
            context,
            queries,
            timeout,
            responses: QueryResponses::new(),
        }
    }

    async fn response(&mut self, name: &str) -> QueryResponse {
        if let Some(response) = self.responses.get(name) {
            return response.clone();
        }

        let response = match self.queries.iter().find(|q| q.name() == name) {
            None => QueryResponse::Text(format!("unknown query {}", name)),
            Some(query) => match with_timeout(self.timeout, query.query(self.context)).await {
                Ok(response) => response,
                Err(e) => QueryResponse::Text(format!("{:#}", e)),
            },
        };
        debug!(address = %self.context.address(), "{} -> {:?}", name, response);
        self.responses.insert(name.to_string(), response.clone());
        response
    }

    async fn matches(&mut self, criteria: &[(String, MatchCriterion)]) -> bool {
        for (query, criterion) in criteria {
            let response = self.response(query).await;
            if !criterion.is_satisfied_by(&response) {
                return false;
            }
        }
        true
    }
}

/// Classifies addresses into device models
#[derive(Debug, Clone)]
pub struct DetectionEngine {
    registry: Arc<ExtensionRegistry>,
    config: DetectionConfig,
    switchboard: SwitchboardConfig,
    log_dir: PathBuf,
}

impl DetectionEngine {
    /// Create an engine that logs device interaction under `log_dir`
    pub fn new<P: Into<PathBuf>>(
        registry: Arc<ExtensionRegistry>,
        config: DetectionConfig,
        switchboard: SwitchboardConfig,
        log_dir: P,
    ) -> Self {
        Self {
            registry,
            config,
            switchboard,
            log_dir: log_dir.into(),
        }
    }

    /// Scan every communication type, skipping addresses in `known`
    pub async fn detect(&self, known: &BTreeSet<String>) -> DetectionReport {
        let span = operation_span("detect", "detection");
        self.detect_inner(known).instrument(span).await
    }

    async fn detect_inner(&self, known: &BTreeSet<String>) -> DetectionReport {
        let mut report = DetectionReport::default();
        let concurrency = self.config.max_concurrent_queries.max(1);

        for communication in self.registry.communication_types() {
            let comm_name = communication.name().to_string();
            let addresses = match communication.list_addresses().await {
                Ok(addresses) => addresses,
                Err(e) => {
                    warn!("Failed to enumerate {} addresses: {}", comm_name, e);
                    report.errors.push(DetectionFailure {
                        communication_type: comm_name,
                        address: None,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            let mut seen = BTreeSet::new();
            let candidates: Vec<String> = addresses
                .into_iter()
                .filter(|a| !known.contains(a) && seen.insert(a.clone()))
                .collect();
            debug!("{} candidate {} addresses", candidates.len(), comm_name);

            let outcomes: Vec<(String, Result<Option<DeviceRecord>>)> = stream::iter(candidates)
                .map(|address| async move {
                    let outcome = self.classify(communication, &address).await;
                    (address, outcome)
                })
                .buffered(concurrency)
                .collect()
                .await;

            for (address, outcome) in outcomes {
                match outcome {
                    Ok(Some(record)) => {
                        info!("Detected {} ({}) at {}", record.name(), record.device_type(), address);
                        report.detected.push(record);
                    }
                    Ok(None) => {
                        info!("No model matches {} address {}", comm_name, address);
                        report.unknown.push(UnknownAddress {
                            communication_type: comm_name.clone(),
                            address,
                        });
                    }
                    Err(e) => {
                        warn!("Detection failed for {}: {}", address, e);
                        report.errors.push(DetectionFailure {
                            communication_type: comm_name.clone(),
                            address: Some(address),
                            reason: e.to_string(),
                        });
                    }
                }
            }
        }

        report
    }

    /// Classify one address; `None` if no model matches
    pub async fn classify(
        &self,
        communication: &Arc<dyn CommunicationType>,
        address: &str,
    ) -> Result<Option<DeviceRecord>> {
        let models = self.registry.models_for_communication_type(communication.name());
        if models.is_empty() {
            return Ok(None);
        }

        let context = DetectContext::new(
            address,
            Arc::clone(communication),
            self.detect_log_path(address),
            self.switchboard.clone(),
        );
        let mut cache = QueryCache::new(
            &context,
            self.registry.detect_queries(communication.name()),
            self.config.query_timeout(),
        );

        for model in models {
            if cache.matches(&model.match_criteria).await {
                debug!("{} matches model {}", address, model.id);
                return self.identify(model, &context, &cache.responses).await.map(Some);
            }
            debug!("{} does not match model {}", address, model.id);
        }
        Ok(None)
    }

    async fn identify(
        &self,
        model: &DeviceModelDescriptor,
        context: &DetectContext,
        responses: &QueryResponses,
    ) -> Result<DeviceRecord> {
        let mut record = default_identity(model, context.address());
        let Some(identify) = &model.identify else {
            return Ok(record);
        };

        let overrides = identify
            .identify(model, context, responses)
            .await
            .map_err(|e| DeviceError::detection(format!("{} identify failed for {}: {:#}", model.id, context.address(), e)))?;
        let renamed = overrides.contains_key(SERIAL_NUMBER) && !overrides.contains_key(NAME);
        record.persistent.extend(overrides);
        if renamed {
            let name = device_name(&model.id, record.serial_number());
            record.persistent.insert(NAME.to_string(), name.into());
        }
        Ok(record)
    }

    fn detect_log_path(&self, address: &str) -> PathBuf {
        let safe: String = address
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        self.log_dir.join(format!("detect_{}.txt", safe))
    }
}
