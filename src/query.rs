//! Query-side data carried through selection and the id multiplexer.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

use crate::hash::burtle_ci;
use crate::settings::Settings;

/// Context for a single selection decision.
///
/// Built by the router from the incoming question; policies read it but
/// never mutate it. The fingerprint is the case-insensitive hash of the
/// query name under the process-wide perturbation.
#[derive(Debug, Clone)]
pub struct QueryContext {
    /// Query name, as received.
    pub qname: String,

    /// Query type code.
    pub qtype: u16,

    /// Query class code.
    pub qclass: u16,

    /// Hash of `qname` under the frozen perturbation seed.
    pub fingerprint: u32,

    /// Tags set by earlier processing. `orderedWrandUntag` skips servers
    /// whose name-with-address appears as a key here.
    pub tags: Option<HashMap<String, String>>,
}

impl QueryContext {
    /// Build a context for a question, fingerprinting the name.
    #[must_use]
    pub fn new(qname: impl Into<String>, qtype: u16, qclass: u16, settings: &Settings) -> Self {
        let qname = qname.into();
        let fingerprint = burtle_ci(qname.as_bytes(), settings.hash_perturbation);
        Self {
            qname,
            qtype,
            qclass,
            fingerprint,
            tags: None,
        }
    }

    /// Tag a server so `orderedWrandUntag` skips it.
    #[must_use]
    pub fn with_tag(mut self, server: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags
            .get_or_insert_with(HashMap::new)
            .insert(server.into(), value.into());
        self
    }
}

/// In-flight query state owned by an id slot between dispatch and
/// response (or expiry).
///
/// The core treats this as opaque: it is handed in by the caller at
/// `save_state` time and handed back whole on `get_state` or through the
/// timeout handler.
#[derive(Debug, Clone)]
pub struct PendingQuery {
    /// Query name, kept for timeout reporting.
    pub qname: String,

    /// Query type code.
    pub qtype: u16,

    /// Query class code.
    pub qclass: u16,

    /// Transaction id the client used, restored on the way back.
    pub original_id: u16,

    /// Client address the response must go to.
    pub client: Option<SocketAddr>,

    /// When the query was handed to the backend.
    pub received_at: Instant,
}

impl PendingQuery {
    /// Create in-flight state for a question.
    #[must_use]
    pub fn new(qname: impl Into<String>, qtype: u16, qclass: u16) -> Self {
        Self {
            qname: qname.into(),
            qtype,
            qclass,
            original_id: 0,
            client: None,
            received_at: Instant::now(),
        }
    }

    /// Set the client-side transaction id.
    #[must_use]
    pub fn with_original_id(mut self, id: u16) -> Self {
        self.original_id = id;
        self
    }

    /// Set the client address.
    #[must_use]
    pub fn with_client(mut self, client: SocketAddr) -> Self {
        self.client = Some(client);
        self
    }
}
