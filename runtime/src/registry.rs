//! Named resources and binding resolution.

use crate::error_log::ErrorLog;
use primordia_broker::{Broker, UsageContext, UsageReport};
use primordia_error::{Error, ErrorKind};
use std::any::Any;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

/// How a binding intends to use a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageType {
    /// Consume from a queue through the monitoring wrapper
    QueueIn,
    /// Consume from a queue bypassing monitoring, no behavioural change
    QueueInDirect,
    /// Produce into a queue through the monitoring wrapper
    QueueOut,
    /// Produce into a queue bypassing monitoring, no behavioural change
    QueueOutDirect,
}

impl FromStr for UsageType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "queue-in" => Ok(UsageType::QueueIn),
            "queue-in-direct" => Ok(UsageType::QueueInDirect),
            "queue-out" => Ok(UsageType::QueueOut),
            "queue-out-direct" => Ok(UsageType::QueueOutDirect),
            other => Err(ErrorKind::ConfigInvalid.other(format!("unknown usage type: {}", other))),
        }
    }
}

impl UsageType {
    /// The queue-side context this usage maps onto.
    pub fn context(self) -> UsageContext {
        match self {
            UsageType::QueueIn | UsageType::QueueInDirect => UsageContext::Consumer,
            UsageType::QueueOut | UsageType::QueueOutDirect => UsageContext::Producer,
        }
    }
}

/// A parsed `usageType:resourceName` binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextRef {
    /// Intended usage
    pub usage: UsageType,
    /// Resource name to resolve
    pub resource: String,
}

impl ContextRef {
    /// Parses a binding; an unknown usage type fails fast.
    pub fn parse(binding: &str) -> Result<ContextRef, Error> {
        let (usage, resource) = binding.split_once(':').ok_or_else(|| {
            ErrorKind::ConfigInvalid.other(format!("malformed binding: {}", binding))
        })?;
        if resource.is_empty() {
            return Err(ErrorKind::ConfigInvalid.other(format!("empty resource in {}", binding)));
        }
        Ok(ContextRef {
            usage: usage.parse()?,
            resource: resource.to_string(),
        })
    }
}

/// A named resource with usage-state reporting and an error log.
pub trait Resource: Send + Sync {
    /// Resource name used in bindings.
    fn name(&self) -> &str;

    /// Usage state as seen from `context`.
    fn usage(&self, context: UsageContext) -> UsageReport;

    /// The bounded operational error log.
    fn error_log(&self) -> &ErrorLog;
}

/// A queue registered as a resource.
pub struct QueueResource<T> {
    name: String,
    queue: Arc<dyn Broker<T>>,
    error_log: ErrorLog,
}

impl<T: Send + 'static> QueueResource<T> {
    /// Wraps a broker under a resource name.
    pub fn new<S: ToString>(name: S, queue: Arc<dyn Broker<T>>) -> QueueResource<T> {
        QueueResource {
            name: name.to_string(),
            queue,
            error_log: ErrorLog::default(),
        }
    }

    /// The wrapped queue handle.
    pub fn queue(&self) -> Arc<dyn Broker<T>> {
        Arc::clone(&self.queue)
    }
}

impl<T: Send + 'static> Resource for QueueResource<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn usage(&self, context: UsageContext) -> UsageReport {
        self.queue.usage(context)
    }

    fn error_log(&self) -> &ErrorLog {
        &self.error_log
    }
}

/// Name-keyed resource registry resolving contextual bindings.
///
/// Monitored and direct acquisition return the same handle: the monitoring
/// wrappers are out of scope here and the direct variants are contractually
/// behaviour-preserving.
#[derive(Default)]
pub struct ResourceRegistry {
    resources: HashMap<String, Arc<dyn Resource>>,
    handles: HashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl ResourceRegistry {
    /// Creates an empty registry.
    pub fn new() -> ResourceRegistry {
        ResourceRegistry::default()
    }

    /// Registers a queue resource under its name.
    pub fn register_queue<T: Send + 'static>(&mut self, resource: QueueResource<T>) {
        let name = resource.name().to_string();
        let handle = resource.queue();
        self.resources.insert(name.clone(), Arc::new(resource));
        self.handles.insert(name, Arc::new(handle));
    }

    /// Resolves a required queue binding; failing here fails the service at
    /// construction.
    pub fn acquire_queue<T: Send + 'static>(
        &self,
        binding: &str,
    ) -> Result<Arc<dyn Broker<T>>, Error> {
        let context_ref = ContextRef::parse(binding)?;
        let handle = self.handles.get(&context_ref.resource).ok_or_else(|| {
            ErrorKind::ResourceUnavailable
                .other(format!("no resource named {}", context_ref.resource))
        })?;
        handle
            .downcast_ref::<Arc<dyn Broker<T>>>()
            .cloned()
            .ok_or_else(|| {
                ErrorKind::ResourceUnavailable.other(format!(
                    "resource {} does not carry the requested payload type",
                    context_ref.resource
                ))
            })
    }

    /// Resolves an optional queue binding; a missing resource is `None`, a
    /// malformed binding is still an error.
    pub fn acquire_queue_optional<T: Send + 'static>(
        &self,
        binding: &str,
    ) -> Result<Option<Arc<dyn Broker<T>>>, Error> {
        let context_ref = ContextRef::parse(binding)?;
        match self.handles.get(&context_ref.resource) {
            None => Ok(None),
            Some(handle) => handle
                .downcast_ref::<Arc<dyn Broker<T>>>()
                .cloned()
                .map(Some)
                .ok_or_else(|| {
                    ErrorKind::ResourceUnavailable.other(format!(
                        "resource {} does not carry the requested payload type",
                        context_ref.resource
                    ))
                }),
        }
    }

    /// Looks a resource up by plain name.
    pub fn resource(&self, name: &str) -> Option<&Arc<dyn Resource>> {
        self.resources.get(name)
    }

    /// Iterates all registered resources.
    pub fn resources(&self) -> impl Iterator<Item = &Arc<dyn Resource>> {
        self.resources.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use primordia_broker::MemoryBroker;

    fn registry_with_queue() -> ResourceRegistry {
        let mut registry = ResourceRegistry::new();
        let queue: Arc<dyn Broker<u32>> = Arc::new(MemoryBroker::new(4));
        registry.register_queue(QueueResource::new("tick-data", queue));
        registry
    }

    #[test]
    fn binding_parsing() {
        let parsed = ContextRef::parse("queue-in:tick-data").unwrap();
        assert_eq!(parsed.usage, UsageType::QueueIn);
        assert_eq!(parsed.resource, "tick-data");
        assert_eq!(parsed.usage.context(), UsageContext::Consumer);

        assert!(ContextRef::parse("queue-sideways:tick-data").is_err());
        assert!(ContextRef::parse("tick-data").is_err());
        assert!(ContextRef::parse("queue-in:").is_err());
    }

    #[test]
    fn acquire_resolves_direct_and_monitored_alike() {
        let registry = registry_with_queue();
        let monitored = registry.acquire_queue::<u32>("queue-out:tick-data").unwrap();
        let direct = registry
            .acquire_queue::<u32>("queue-out-direct:tick-data")
            .unwrap();
        monitored.put(1).unwrap();
        direct.put(2).unwrap();
        assert_eq!(monitored.produced_count(), 2);
    }

    #[test]
    fn missing_required_resource_fails() {
        let registry = registry_with_queue();
        let err = match registry.acquire_queue::<u32>("queue-in:no-such-queue") {
            Err(err) => err,
            Ok(_) => panic!("expected missing resource to be rejected"),
        };
        assert_eq!(err.kind(), ErrorKind::ResourceUnavailable);
    }

    #[test]
    fn optional_lookup_is_a_maybe() {
        let registry = registry_with_queue();
        assert!(registry
            .acquire_queue_optional::<u32>("queue-in:no-such-queue")
            .unwrap()
            .is_none());
        assert!(registry
            .acquire_queue_optional::<u32>("queue-in:tick-data")
            .unwrap()
            .is_some());
        assert!(registry
            .acquire_queue_optional::<u32>("bogus:tick-data")
            .is_err());
    }

    #[test]
    fn payload_type_mismatch_is_an_error() {
        let registry = registry_with_queue();
        let err = match registry.acquire_queue::<u64>("queue-in:tick-data") {
            Err(err) => err,
            Ok(_) => panic!("expected payload type mismatch to be rejected"),
        };
        assert_eq!(err.kind(), ErrorKind::ResourceUnavailable);
    }
}
