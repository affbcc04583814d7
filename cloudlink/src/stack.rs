use std::collections::BTreeSet;
use std::sync::Arc;

use regex::Regex;
use serde_json::Value;

use crate::error::{CloudError, Result};
use crate::store::{ConfigurationStore, Properties, ServiceDirectory};

pub const DEFAULT_FACTORY_PID: &str = "cloudlink.DefaultCloudEndpointFactory";
pub const DEFAULT_ENDPOINT_PID: &str = "cloudlink.CloudEndpoint";
pub const DEFAULT_SESSION_PID: &str = "cloudlink.DataSession";
pub const DEFAULT_TRANSPORT_PID: &str = "cloudlink.MqttTransport";

/// Endpoint property carrying the pid of the factory that created the stack.
pub const FACTORY_PID_PROP: &str = "cloud.connection.factory.pid";

const SESSION_REFERENCE: &str = "DataSession";
const TRANSPORT_REFERENCE: &str = "DataTransport";

/// Factory pid and canonical base pid of one layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerNaming {
    pub factory_pid: String,
    pub base_pid: String,
}

impl LayerNaming {
    #[inline]
    pub fn new<F: Into<String>, B: Into<String>>(factory_pid: F, base_pid: B) -> Self {
        Self { factory_pid: factory_pid.into(), base_pid: base_pid.into() }
    }

    /// `base_pid`, or `base_pid-suffix`.
    #[inline]
    pub fn pid(&self, suffix: Option<&str>) -> String {
        match suffix {
            Some(suffix) => format!("{}-{}", self.base_pid, suffix),
            None => self.base_pid.clone(),
        }
    }
}

/// The naming convention of one stack factory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackNaming {
    pub factory_pid: String,
    pub endpoint: LayerNaming,
    pub session: LayerNaming,
    pub transport: LayerNaming,
    /// Reference from the endpoint to its session.
    pub session_reference: String,
    /// Reference from the session to its transport.
    pub transport_reference: String,
}

impl StackNaming {
    pub fn default_factory() -> Self {
        Self::generic(DEFAULT_FACTORY_PID, DEFAULT_ENDPOINT_PID, DEFAULT_SESSION_PID, DEFAULT_TRANSPORT_PID)
    }

    /// Each layer's factory pid is its base pid.
    pub fn generic(factory_pid: &str, endpoint: &str, session: &str, transport: &str) -> Self {
        Self {
            factory_pid: factory_pid.to_owned(),
            endpoint: LayerNaming::new(endpoint, endpoint),
            session: LayerNaming::new(session, session),
            transport: LayerNaming::new(transport, transport),
            session_reference: SESSION_REFERENCE.into(),
            transport_reference: TRANSPORT_REFERENCE.into(),
        }
    }
}

/// An endpoint pid split into its base and optional suffix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackIdentifier {
    pub base_pid: String,
    pub suffix: Option<String>,
}

impl StackIdentifier {
    /// Splits on the first `-`. The base must be the endpoint base of `naming`
    /// and a present suffix must not be empty.
    pub fn parse(input: &str, naming: &StackNaming) -> Result<Self> {
        let (base, suffix) = match input.split_once('-') {
            Some((base, suffix)) => (base, Some(suffix)),
            None => (input, None),
        };

        if base != naming.endpoint.base_pid {
            return Err(CloudError::invalid_argument(format!(
                "invalid pid {}, expected base {}",
                input, naming.endpoint.base_pid
            )));
        }
        if suffix.is_some_and(str::is_empty) {
            return Err(CloudError::invalid_argument(format!("invalid pid {}, empty suffix", input)));
        }

        Ok(Self { base_pid: base.to_owned(), suffix: suffix.map(str::to_owned) })
    }

    #[inline]
    pub fn suffix(&self) -> Option<&str> {
        self.suffix.as_deref()
    }
}

/// The three pids of one stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackPids {
    pub endpoint: String,
    pub session: String,
    pub transport: String,
}

impl StackPids {
    #[inline]
    pub fn to_vec(&self) -> Vec<String> {
        vec![self.endpoint.clone(), self.session.clone(), self.transport.clone()]
    }
}

pub trait CloudConnectionFactory: Send + Sync {
    fn factory_pid(&self) -> &str;

    /// Creates endpoint, session and transport configurations in that order.
    fn create_configuration(&self, pid: &str) -> Result<()>;

    /// Deletes transport, session and endpoint configurations in that order.
    fn delete_configuration(&self, pid: &str) -> Result<()>;

    fn get_stack_components_pids(&self, pid: &str) -> Result<Vec<String>>;

    /// Endpoint pids of the stacks this factory created.
    fn get_managed_pids(&self) -> Result<BTreeSet<String>>;
}

pub struct StackAssembler {
    naming: StackNaming,
    store: Arc<dyn ConfigurationStore>,
    directory: Arc<dyn ServiceDirectory>,
    managed: Regex,
}

impl StackAssembler {
    pub fn new(
        naming: StackNaming,
        store: Arc<dyn ConfigurationStore>,
        directory: Arc<dyn ServiceDirectory>,
    ) -> Result<Self> {
        let managed = Regex::new(&format!("^{}(-[a-zA-Z0-9]+)?$", regex::escape(&naming.endpoint.base_pid)))?;
        Ok(Self { naming, store, directory, managed })
    }

    #[inline]
    pub fn naming(&self) -> &StackNaming {
        &self.naming
    }

    pub fn derive_identifiers(&self, pid: &str) -> Result<StackPids> {
        let id = StackIdentifier::parse(pid, &self.naming)?;
        Ok(StackPids {
            endpoint: self.naming.endpoint.pid(id.suffix()),
            session: self.naming.session.pid(id.suffix()),
            transport: self.naming.transport.pid(id.suffix()),
        })
    }

    fn reference(name: &str, pid: &str) -> (String, Value) {
        (format!("{}.target", name), Value::String(format!("(service.pid={})", pid)))
    }
}

impl CloudConnectionFactory for StackAssembler {
    #[inline]
    fn factory_pid(&self) -> &str {
        &self.naming.factory_pid
    }

    fn create_configuration(&self, pid: &str) -> Result<()> {
        let pids = self.derive_identifiers(pid)?;
        if !self.managed.is_match(&pids.endpoint) {
            return Err(CloudError::invalid_argument(format!("invalid pid {}, suffix must be alphanumeric", pid)));
        }
        log::info!("{} creating stack {:?}", self.naming.factory_pid, pids);

        let mut endpoint_props = Properties::new();
        endpoint_props.insert(FACTORY_PID_PROP.into(), Value::String(self.naming.factory_pid.clone()));
        let (k, v) = Self::reference(&self.naming.session_reference, &pids.session);
        endpoint_props.insert(k, v);
        self.store.create_factory_configuration(
            &self.naming.endpoint.factory_pid,
            &pids.endpoint,
            endpoint_props,
            false,
        )?;

        let mut session_props = Properties::new();
        let (k, v) = Self::reference(&self.naming.transport_reference, &pids.transport);
        session_props.insert(k, v);
        self.store.create_factory_configuration(&self.naming.session.factory_pid, &pids.session, session_props, false)?;

        self.store.create_factory_configuration(
            &self.naming.transport.factory_pid,
            &pids.transport,
            Properties::new(),
            true,
        )
    }

    fn delete_configuration(&self, pid: &str) -> Result<()> {
        let pids = self.derive_identifiers(pid)?;
        log::info!("{} deleting stack {:?}", self.naming.factory_pid, pids);
        self.store.delete_factory_configuration(&pids.transport, false)?;
        self.store.delete_factory_configuration(&pids.session, false)?;
        self.store.delete_factory_configuration(&pids.endpoint, true)
    }

    fn get_stack_components_pids(&self, pid: &str) -> Result<Vec<String>> {
        Ok(self.derive_identifiers(pid)?.to_vec())
    }

    fn get_managed_pids(&self) -> Result<BTreeSet<String>> {
        Ok(self
            .directory
            .instances()
            .into_iter()
            .filter(|i| self.managed.is_match(&i.pid))
            .filter(|i| i.properties.get(FACTORY_PID_PROP).and_then(Value::as_str) == Some(self.factory_pid()))
            .map(|i| i.pid)
            .collect())
    }
}
