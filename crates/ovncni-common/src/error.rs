//! Common error types for the attachment pipeline.

use std::fmt;
use std::time::Duration;

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`CniError`].
pub type CniResult<T> = Result<T, CniError>;

/// OVSDB error tags that describe a transient condition.
const RETRYABLE_DB_ERRORS: &[&str] = &["timed out", "aborted", "resources exhausted", "I/O error"];

/// Kernel state left behind by an interrupted link creation.
///
/// DEL uses the deterministic host interface name to remove whatever is
/// recorded here, so nothing is rolled back at the point of failure.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartialLink {
    /// Host-side interface name.
    pub host: String,
    /// The veth pair exists in the host namespace.
    pub pair_created: bool,
    /// The peer was moved into the target namespace.
    pub peer_moved: bool,
    /// The peer was renamed, addressed and brought up.
    pub peer_configured: bool,
    /// The host side was brought up.
    pub host_up: bool,
}

impl PartialLink {
    /// Start tracking a link pair that has not been created yet.
    #[must_use]
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Self::default()
        }
    }

    /// Whether any kernel object was created.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        !self.pair_created
    }
}

impl fmt::Display for PartialLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "{} (nothing created)", self.host);
        }
        write!(
            f,
            "{} (created={}, moved={}, configured={}, up={})",
            self.host, self.pair_created, self.peer_moved, self.peer_configured, self.host_up
        )
    }
}

/// Errors raised anywhere in the attach/detach pipeline.
#[derive(Error, Diagnostic, Debug)]
pub enum CniError {
    /// The address allocator could not be reached or refused the request.
    #[error("Address allocation failed: {message}")]
    #[diagnostic(code(ovncni::allocation))]
    Allocation {
        /// The error message.
        message: String,
    },

    /// The address allocator answered with a value that does not parse.
    #[error("Malformed lease: {field} = {value:?}")]
    #[diagnostic(
        code(ovncni::allocation::malformed),
        help("The allocator returned data that will not improve on retry; check the allocator")
    )]
    MalformedLease {
        /// The offending response field.
        field: String,
        /// The raw value.
        value: String,
    },

    /// A link pair could not be fully created.
    #[error("Link creation failed during {step}: {message} [partial: {partial}]")]
    #[diagnostic(code(ovncni::link))]
    LinkCreation {
        /// The step that failed.
        step: &'static str,
        /// The error message.
        message: String,
        /// What exists in the kernel after the failure.
        partial: PartialLink,
    },

    /// A network namespace could not be opened, entered or restored.
    #[error("Network namespace error for {path}: {message}")]
    #[diagnostic(code(ovncni::netns))]
    Namespace {
        /// The namespace path.
        path: String,
        /// The error message.
        message: String,
    },

    /// The integration bridge does not exist.
    #[error("Bridge not found: {bridge}")]
    #[diagnostic(
        code(ovncni::ovs::bridge_not_found),
        help("Bridges are provisioned outside of this plugin; create it with ovs-vsctl add-br")
    )]
    BridgeNotFound {
        /// The bridge name.
        bridge: String,
    },

    /// The logical switch does not exist in the northbound database.
    #[error("Logical switch not found: {switch}")]
    #[diagnostic(
        code(ovncni::ovn::switch_not_found),
        help("Logical switches are provisioned outside of this plugin; create it with ovn-nbctl ls-add")
    )]
    LogicalSwitchNotFound {
        /// The logical switch name.
        switch: String,
    },

    /// An operation inside an OVSDB transaction failed.
    #[error("Transaction failed at operation {index}: {error} ({details})")]
    #[diagnostic(code(ovncni::ovsdb::registration))]
    Registration {
        /// Index of the failing operation in the transaction.
        index: usize,
        /// The OVSDB error tag.
        error: String,
        /// Free-form details from the server.
        details: String,
    },

    /// A bounded wait expired.
    #[error("Timed out after {after:?} waiting for {operation}")]
    #[diagnostic(code(ovncni::timeout))]
    Timeout {
        /// What was being waited for.
        operation: String,
        /// How long we waited.
        after: Duration,
    },

    /// Workload metadata could not be read.
    #[error("Metadata lookup failed for {workload}: {message}")]
    #[diagnostic(code(ovncni::metadata))]
    MetadataLookup {
        /// The workload identity.
        workload: String,
        /// The error message.
        message: String,
    },

    /// CHECK found part of an attachment missing.
    #[error("Attachment {host} is missing its {missing}")]
    #[diagnostic(
        code(ovncni::check),
        help("Run DEL and ADD again to rebuild the attachment")
    )]
    AttachmentMissing {
        /// Host interface name of the attachment.
        host: String,
        /// The missing component.
        missing: &'static str,
    },

    /// An interface name is not usable by the kernel.
    #[error("Invalid interface name {name:?}: {reason}")]
    #[diagnostic(
        code(ovncni::link::invalid_name),
        help("Interface names must be 1-15 bytes without '/', ':' or whitespace")
    )]
    InvalidInterfaceName {
        /// The rejected name.
        name: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// The database connection failed or returned a protocol error.
    #[error("Database error: {message}")]
    #[diagnostic(code(ovncni::ovsdb))]
    Database {
        /// The error message.
        message: String,
    },

    /// Configuration error.
    #[error("Configuration error: {message}")]
    #[diagnostic(code(ovncni::config))]
    Config {
        /// The error message.
        message: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(ovncni::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(ovncni::serialization))]
    Serialization(String),
}

impl CniError {
    /// Whether retrying the same request may succeed.
    ///
    /// Lookup failures for bridges and logical switches are environment
    /// misconfiguration and never retryable.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Allocation { .. } | Self::Timeout { .. } | Self::Database { .. } => true,
            Self::Registration { error, .. } => RETRYABLE_DB_ERRORS.contains(&error.as_str()),
            _ => false,
        }
    }

    /// Error code reported to the container runtime.
    ///
    /// Codes below 100 are the well-known CNI codes; the rest are specific
    /// to this plugin.
    #[must_use]
    pub fn cni_code(&self) -> u32 {
        if self.is_retryable() && !matches!(self, Self::Allocation { .. }) {
            return 11;
        }
        match self {
            Self::InvalidInterfaceName { .. } => 4,
            Self::Io(_) => 5,
            Self::Serialization(_) => 6,
            Self::Config { .. } => 7,
            Self::Allocation { .. } => 100,
            Self::MalformedLease { .. } => 101,
            Self::LinkCreation { .. } => 102,
            Self::Namespace { .. } => 103,
            Self::BridgeNotFound { .. } => 104,
            Self::LogicalSwitchNotFound { .. } => 105,
            Self::Registration { .. } => 106,
            Self::MetadataLookup { .. } => 107,
            Self::AttachmentMissing { .. } => 108,
            Self::Timeout { .. } | Self::Database { .. } => 11,
        }
    }
}

impl From<serde_json::Error> for CniError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
