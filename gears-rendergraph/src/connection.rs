//! Graph topology: nodes in insertion order plus the edges between them.

use derive_more::Display;
use log::warn;
use gears_core::collections::hashset::HashSet;
use crate::error::GraphError;
use crate::operation::Operation;
use crate::resource::Resource;

/// Position of a resource in its [`ConnectionSet`].
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[display("resource#{_0}")]
pub struct ResourceId(pub(crate) u32);

/// Position of an operation in its [`ConnectionSet`].
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[display("operation#{_0}")]
pub struct OperationId(pub(crate) u32);

impl ResourceId {
    #[inline]
    pub fn index(self) -> usize { self.0 as usize }
}

impl OperationId {
    #[inline]
    pub fn index(self) -> usize { self.0 as usize }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NodeId {
    Resource(ResourceId),
    Operation(OperationId),
}

#[derive(Clone, Debug, PartialEq)]
pub enum Node {
    Resource(Resource),
    Operation(Operation),
}

impl Node {
    pub fn name(&self) -> &str {
        match self {
            Node::Resource(resource) => resource.name(),
            Node::Operation(operation) => operation.name(),
        }
    }
}

/// Per-edge binding information.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BindingMeta {
    /// Pipeline binding for inputs, colour attachment index for render outputs.
    pub binding: u32,
    /// Array elements bound, one per image layer.
    pub layer_count: u32,
    /// Follow the frame slot for multi-buffered resources. Static edges always
    /// use the first copy.
    pub per_frame: bool,
}

impl BindingMeta {
    pub fn new(binding: u32) -> Self {
        Self { binding, layer_count: 1, per_frame: true }
    }

    pub fn with_layers(mut self, layer_count: u32) -> Self {
        self.layer_count = layer_count;
        self
    }

    pub fn static_binding(mut self) -> Self {
        self.per_frame = false;
        self
    }
}

impl From<u32> for BindingMeta {
    fn from(binding: u32) -> Self {
        Self::new(binding)
    }
}

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Resource read by the operation.
    #[display("input")]
    Input,
    /// Resource written by the operation.
    #[display("output")]
    Output,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Connection {
    pub operation: OperationId,
    pub resource: ResourceId,
    pub direction: Direction,
    pub binding: BindingMeta,
}

/// All nodes of a graph and the connections between them.
///
/// Only mutated while the graph is assembled. Node order is the order of
/// insertion and is what the compiler falls back to between independent
/// operations.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConnectionSet {
    nodes: Vec<Node>,
    connections: Vec<Connection>,
}

impl ConnectionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_resource(&mut self, resource: Resource) -> Result<ResourceId, GraphError> {
        self.check_name(resource.name())?;
        let id = ResourceId(self.nodes.len() as u32);
        self.nodes.push(Node::Resource(resource));
        Ok(id)
    }

    pub fn add_operation(&mut self, operation: Operation) -> Result<OperationId, GraphError> {
        self.check_name(operation.name())?;
        let id = OperationId(self.nodes.len() as u32);
        self.nodes.push(Node::Operation(operation));
        Ok(id)
    }

    /// `operation` reads `resource` through `binding`.
    pub fn add_input(
        &mut self,
        resource: ResourceId,
        operation: OperationId,
        binding: impl Into<BindingMeta>,
    ) -> Result<(), GraphError> {
        self.add_connection(Connection { operation, resource, direction: Direction::Input, binding: binding.into() })
    }

    /// `operation` writes `resource` through `binding`.
    pub fn add_output(
        &mut self,
        operation: OperationId,
        resource: ResourceId,
        binding: impl Into<BindingMeta>,
    ) -> Result<(), GraphError> {
        self.add_connection(Connection { operation, resource, direction: Direction::Output, binding: binding.into() })
    }

    fn add_connection(&mut self, connection: Connection) -> Result<(), GraphError> {
        let resource_name = self
            .resource(connection.resource)
            .ok_or(GraphError::UnknownNode { kind: "resource", index: connection.resource.0 })?
            .name()
            .to_owned();
        let operation_name = self
            .operation(connection.operation)
            .ok_or(GraphError::UnknownNode { kind: "operation", index: connection.operation.0 })?
            .name()
            .to_owned();

        let same_edge = self.connections.iter().any(|c| {
            c.operation == connection.operation
                && c.resource == connection.resource
                && c.direction == connection.direction
        });
        if same_edge {
            warn!(
                "Operation [{operation_name}] already has resource [{resource_name}] as {}, ignoring!",
                connection.direction
            );
            return Ok(());
        }

        let slot_taken = self.connections.iter().any(|c| {
            c.operation == connection.operation
                && c.direction == connection.direction
                && c.binding.binding == connection.binding.binding
        });
        if slot_taken {
            return Err(GraphError::BindingAlreadyResolved {
                operation: operation_name,
                direction: match connection.direction {
                    Direction::Input => "input",
                    Direction::Output => "output",
                },
                binding: connection.binding.binding,
            });
        }

        self.connections.push(connection);
        Ok(())
    }

    fn check_name(&self, name: &str) -> Result<(), GraphError> {
        if !name.is_empty() && self.node_by_name(name).is_some() {
            return Err(GraphError::DuplicateName(name.to_owned()));
        }
        Ok(())
    }

    /// Re-check that non-empty names are unique.
    pub fn validate(&self) -> Result<(), GraphError> {
        let mut seen = HashSet::default();
        for node in &self.nodes {
            let name = node.name();
            if !name.is_empty() && !seen.insert(name) {
                return Err(GraphError::DuplicateName(name.to_owned()));
            }
        }
        Ok(())
    }

    pub fn node_by_name(&self, name: &str) -> Option<NodeId> {
        self.nodes.iter().enumerate().find(|(_, node)| node.name() == name).map(|(index, node)| {
            let index = index as u32;
            match node {
                Node::Resource(_) => NodeId::Resource(ResourceId(index)),
                Node::Operation(_) => NodeId::Operation(OperationId(index)),
            }
        })
    }

    pub fn resource_by_name(&self, name: &str) -> Option<ResourceId> {
        match self.node_by_name(name)? {
            NodeId::Resource(id) => Some(id),
            NodeId::Operation(_) => None,
        }
    }

    pub fn operation_by_name(&self, name: &str) -> Option<OperationId> {
        match self.node_by_name(name)? {
            NodeId::Operation(id) => Some(id),
            NodeId::Resource(_) => None,
        }
    }

    pub fn resource(&self, id: ResourceId) -> Option<&Resource> {
        match self.nodes.get(id.index())? {
            Node::Resource(resource) => Some(resource),
            Node::Operation(_) => None,
        }
    }

    pub fn operation(&self, id: OperationId) -> Option<&Operation> {
        match self.nodes.get(id.index())? {
            Node::Operation(operation) => Some(operation),
            Node::Resource(_) => None,
        }
    }

    /// Every node in insertion order.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn connections(&self) -> &[Connection] {
        &self.connections
    }

    pub fn resources(&self) -> impl Iterator<Item = (ResourceId, &Resource)> + '_ {
        self.nodes.iter().enumerate().filter_map(|(index, node)| match node {
            Node::Resource(resource) => Some((ResourceId(index as u32), resource)),
            Node::Operation(_) => None,
        })
    }

    pub fn operations(&self) -> impl Iterator<Item = (OperationId, &Operation)> + '_ {
        self.nodes.iter().enumerate().filter_map(|(index, node)| match node {
            Node::Operation(operation) => Some((OperationId(index as u32), operation)),
            Node::Resource(_) => None,
        })
    }

    /// Connections of `operation` in `direction`, in connection order.
    pub fn connections_of(
        &self,
        operation: OperationId,
        direction: Direction,
    ) -> impl Iterator<Item = &Connection> + '_ {
        self.connections.iter().filter(move |c| c.operation == operation && c.direction == direction)
    }

    pub fn inputs_of(&self, operation: OperationId) -> impl Iterator<Item = &Connection> + '_ {
        self.connections_of(operation, Direction::Input)
    }

    pub fn outputs_of(&self, operation: OperationId) -> impl Iterator<Item = &Connection> + '_ {
        self.connections_of(operation, Direction::Output)
    }

    /// Operations writing `resource`.
    pub fn writers_of(&self, resource: ResourceId) -> impl Iterator<Item = OperationId> + '_ {
        self.connections
            .iter()
            .filter(move |c| c.resource == resource && c.direction == Direction::Output)
            .map(|c| c.operation)
    }

    /// Operations reading `resource`.
    pub fn readers_of(&self, resource: ResourceId) -> impl Iterator<Item = OperationId> + '_ {
        self.connections
            .iter()
            .filter(move |c| c.resource == resource && c.direction == Direction::Input)
            .map(|c| c.operation)
    }

    pub fn has_swapchain_resource(&self) -> bool {
        self.resources().any(|(_, resource)| resource.kind() == &crate::resource::ResourceKind::SwapchainImage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gears_rhi::Format;
    use crate::operation::Operation;
    use crate::resource::ImageDesc;

    fn image(name: &str) -> Resource {
        Resource::writable_image(name, ImageDesc::new_2d(4, 4, Format::Rgba8Unorm))
    }

    #[test]
    fn names_are_unique_but_may_be_empty() {
        let mut set = ConnectionSet::new();
        set.add_resource(image("a")).unwrap();
        assert_eq!(set.add_resource(image("a")), Err(GraphError::DuplicateName("a".to_owned())));
        assert_eq!(set.add_operation(Operation::transfer("a")), Err(GraphError::DuplicateName("a".to_owned())));

        set.add_resource(image("")).unwrap();
        set.add_resource(image("")).unwrap();
        assert!(set.validate().is_ok());
        assert_eq!(set.nodes().len(), 3);
    }

    #[test]
    fn lookup_by_name() {
        let mut set = ConnectionSet::new();
        let r = set.add_resource(image("target")).unwrap();
        let o = set.add_operation(Operation::transfer("copy")).unwrap();

        assert_eq!(set.node_by_name("target"), Some(NodeId::Resource(r)));
        assert_eq!(set.operation_by_name("copy"), Some(o));
        assert_eq!(set.resource_by_name("copy"), None);
        assert_eq!(set.node_by_name("missing"), None);
        assert!(set.operation(OperationId(r.0)).is_none());
    }

    #[test]
    fn binding_slots_resolve_once() {
        let mut set = ConnectionSet::new();
        let a = set.add_resource(image("a")).unwrap();
        let b = set.add_resource(image("b")).unwrap();
        let op = set.add_operation(Operation::transfer("copy")).unwrap();

        set.add_input(a, op, 0).unwrap();
        // same edge again is only a warning
        set.add_input(a, op, 0).unwrap();
        assert_eq!(set.inputs_of(op).count(), 1);

        let err = set.add_input(b, op, 0).unwrap_err();
        assert!(matches!(err, GraphError::BindingAlreadyResolved { binding: 0, .. }));

        set.add_output(op, b, 0).unwrap();
        assert_eq!(set.writers_of(b).collect::<Vec<_>>(), vec![op]);
        assert_eq!(set.readers_of(a).collect::<Vec<_>>(), vec![op]);
    }

    #[test]
    fn connections_need_existing_nodes() {
        let mut set = ConnectionSet::new();
        let a = set.add_resource(image("a")).unwrap();
        let err = set.add_input(a, OperationId(7), 0).unwrap_err();
        assert_eq!(err, GraphError::UnknownNode { kind: "operation", index: 7 });

        let op = set.add_operation(Operation::transfer("copy")).unwrap();
        // an operation id is not a resource id
        let err = set.add_output(op, ResourceId(op.0), 0).unwrap_err();
        assert!(matches!(err, GraphError::UnknownNode { kind: "resource", .. }));
    }
}
