// Copyright Starmesh Contributors 2025
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//!
//! Endpoint is the resolved binding of an action or event name to a concrete
//! service target on a node. Resolution itself (registry, strategies) is an
//! external collaborator; contexts only consume the resolved shape.

use faststr::FastStr;

/// Descriptor of the service owning an action or event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    /// Short service name, e.g. `posts`.
    pub name: FastStr,
    /// Optional version prefix.
    pub version: Option<FastStr>,
    /// Full name used in `caller` propagation, e.g. `v2.posts`.
    pub full_name: FastStr,
}

impl ServiceInfo {
    /// Creates an unversioned service descriptor.
    pub fn new(name: impl Into<FastStr>) -> Self {
        let name = name.into();
        Self {
            full_name: name.clone(),
            name,
            version: None,
        }
    }

    /// Sets the version and recomputes the full name as `{version}.{name}`.
    pub fn with_version(mut self, version: impl Into<FastStr>) -> Self {
        let version = version.into();
        self.full_name = FastStr::new(format!("{}.{}", version, self.name));
        self.version = Some(version);
        self
    }
}

/// A callable action exposed by a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionSchema {
    /// Fully qualified action name, e.g. `posts.get`.
    pub name: FastStr,
    /// Owning service.
    pub service: ServiceInfo,
}

impl ActionSchema {
    /// Creates an action schema.
    pub fn new(name: impl Into<FastStr>, service: ServiceInfo) -> Self {
        Self {
            name: name.into(),
            service,
        }
    }
}

/// An event subscription exposed by a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventSchema {
    /// Event name, e.g. `user.created`.
    pub name: FastStr,
    /// Owning service.
    pub service: ServiceInfo,
    /// Optional delivery group overriding the service name.
    pub group: Option<FastStr>,
}

impl EventSchema {
    /// Creates an event schema.
    pub fn new(name: impl Into<FastStr>, service: ServiceInfo) -> Self {
        Self {
            name: name.into(),
            service,
            group: None,
        }
    }

    /// Sets the delivery group.
    pub fn with_group(mut self, group: impl Into<FastStr>) -> Self {
        self.group = Some(group.into());
        self
    }
}

/// What an endpoint is bound to: exactly one of action or event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointTarget {
    /// A callable action.
    Action(ActionSchema),
    /// An event subscription.
    Event(EventSchema),
}

/// Resolved binding of an action/event to a service instance on a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Id of the node hosting the target.
    pub id: FastStr,
    /// The bound action or event.
    pub target: EndpointTarget,
}

impl Endpoint {
    /// Creates an endpoint bound to an action.
    pub fn action(node_id: impl Into<FastStr>, action: ActionSchema) -> Self {
        Self {
            id: node_id.into(),
            target: EndpointTarget::Action(action),
        }
    }

    /// Creates an endpoint bound to an event.
    pub fn event(node_id: impl Into<FastStr>, event: EventSchema) -> Self {
        Self {
            id: node_id.into(),
            target: EndpointTarget::Event(event),
        }
    }

    /// The bound action, if any.
    pub fn action_schema(&self) -> Option<&ActionSchema> {
        match &self.target {
            EndpointTarget::Action(action) => Some(action),
            EndpointTarget::Event(_) => None,
        }
    }

    /// The bound event, if any.
    pub fn event_schema(&self) -> Option<&EventSchema> {
        match &self.target {
            EndpointTarget::Action(_) => None,
            EndpointTarget::Event(event) => Some(event),
        }
    }

    /// Service owning the bound target.
    pub fn service(&self) -> &ServiceInfo {
        match &self.target {
            EndpointTarget::Action(action) => &action.service,
            EndpointTarget::Event(event) => &event.service,
        }
    }
}
