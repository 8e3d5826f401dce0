//! The in-memory GATT object model: an arena of nodes, each carrying zero or
//! more D-Bus interface attachments. Pure data plus pure (non-blocking,
//! non-I/O) handler closures — nothing in this module touches a bus
//! connection. The publisher (`crate::publisher`) is the only component that
//! bridges this tree onto `dbus`.

pub mod introspect;

use std::{
    collections::BTreeMap,
    fmt,
    sync::{Arc, Mutex},
};

use displaydoc::Display;

use crate::{path::ObjectPath, value::Value};

/// Opaque, stable index of a node within a [`Tree`]. Never reused after
/// removal (nodes are never removed post-registration, per the lifecycle
/// invariant that the tree is frozen once `Running`).
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub struct NodeId(usize);

/// An error a method or property handler hands back to the remote D-Bus
/// caller. Never unwinds; never reaches the run-state machine.
#[derive(Clone, Debug, Display, Eq, PartialEq)]
pub enum HandlerError {
    /// operation not permitted
    NotPermitted,
    /// operation not authorized
    NotAuthorized,
    /// value has invalid length
    InvalidValueLength,
    /// operation in progress
    InProgress,
    /// operation not supported
    NotSupported,
    /// {0}
    Failed(String),
}

pub type HandlerResult<T> = std::result::Result<T, HandlerError>;

/// A property getter/setter pair, both optional, both pure and
/// non-blocking: they read/write in-memory state synchronously.
#[derive(Clone)]
pub struct Property {
    pub name: String,
    pub signature: &'static str,
    pub emits_change: bool,
    pub get: Option<Arc<dyn Fn() -> HandlerResult<Value> + Send + Sync>>,
    pub set: Option<Arc<dyn Fn(Value) -> HandlerResult<()> + Send + Sync>>,
}

impl fmt::Debug for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Property")
            .field("name", &self.name)
            .field("signature", &self.signature)
            .field("readable", &self.get.is_some())
            .field("writable", &self.set.is_some())
            .finish()
    }
}

impl Property {
    pub fn read_only(name: impl Into<String>, signature: &'static str, get: impl Fn() -> HandlerResult<Value> + Send + Sync + 'static) -> Self {
        Self { name: name.into(), signature, emits_change: false, get: Some(Arc::new(get)), set: None }
    }

    /// A read-only property the server actively notifies change on (spec's
    /// `{read, write, emits-change}` Property entity) — used for the
    /// characteristic/descriptor `Value` property when the node carries the
    /// `notify`/`indicate` flag.
    pub fn notifying(name: impl Into<String>, signature: &'static str, get: impl Fn() -> HandlerResult<Value> + Send + Sync + 'static) -> Self {
        let mut p = Self::read_only(name, signature, get);
        p.emits_change = true;
        p
    }
}

/// A method descriptor: name, argument/return signatures, and the handler
/// invoked with decoded arguments.
#[derive(Clone)]
pub struct Method {
    pub name: String,
    pub in_signature: Vec<&'static str>,
    pub out_signature: &'static str,
    pub handler: Arc<dyn Fn(Vec<Value>) -> HandlerResult<Value> + Send + Sync>,
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Method")
            .field("name", &self.name)
            .field("in_signature", &self.in_signature)
            .field("out_signature", &self.out_signature)
            .finish()
    }
}

/// A signal descriptor (documentation-only; the publisher constructs and
/// emits the actual D-Bus signal message).
#[derive(Clone, Debug)]
pub struct Signal {
    pub name: String,
    pub arg_signatures: Vec<&'static str>,
}

/// Which of the five known interface shapes an [`Interface`] realises. Kept
/// distinct from `name` so the publisher and the advertising-payload policy
/// can match on it without string comparison.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum InterfaceKind {
    GattService,
    GattCharacteristic,
    GattDescriptor,
    ObjectManager,
    Advertisement,
}

impl InterfaceKind {
    pub fn dbus_name(self) -> &'static str {
        match self {
            InterfaceKind::GattService => "org.bluez.GattService1",
            InterfaceKind::GattCharacteristic => "org.bluez.GattCharacteristic1",
            InterfaceKind::GattDescriptor => "org.bluez.GattDescriptor1",
            InterfaceKind::ObjectManager => "org.freedesktop.DBus.ObjectManager",
            InterfaceKind::Advertisement => "org.bluez.LEAdvertisement1",
        }
    }
}

/// A named D-Bus interface attached to a [`Node`].
#[derive(Clone, Debug)]
pub struct Interface {
    pub kind: InterfaceKind,
    pub properties: Vec<Property>,
    pub methods: Vec<Method>,
    pub signals: Vec<Signal>,
}

impl Interface {
    pub fn new(kind: InterfaceKind) -> Self {
        Self { kind, properties: Vec::new(), methods: Vec::new(), signals: Vec::new() }
    }

    pub fn name(&self) -> &'static str {
        self.kind.dbus_name()
    }

    pub fn property(&self, name: &str) -> Option<&Property> {
        self.properties.iter().find(|p| p.name == name)
    }

    pub fn method(&self, name: &str) -> Option<&Method> {
        self.methods.iter().find(|m| m.name == name)
    }
}

/// A single node in the GATT object tree.
#[derive(Debug)]
pub struct Node {
    pub path: ObjectPath,
    pub parent: Option<NodeId>,
    pub children: Vec<(String, NodeId)>,
    pub published: bool,
    pub interfaces: Vec<Interface>,
}

impl Node {
    fn new(path: ObjectPath, parent: Option<NodeId>, published: bool) -> Self {
        Self { path, parent, children: Vec::new(), published, interfaces: Vec::new() }
    }
}

/// Errors surfaced by tree operations. Never panics.
#[derive(Clone, Debug, Display, Eq, PartialEq)]
pub enum TreeError {
    /// a child named {0:?} already exists under this node
    DuplicatePath(String),
    /// interface {0} already attached to this node
    DuplicateInterface(&'static str),
    /// no node at path {0}
    UnknownPath(String),
    /// no interface {1} at path {0}
    UnknownInterface(String, &'static str),
    /// no property {2} on interface {1} at path {0}
    UnknownProperty(String, &'static str, String),
}

pub type TreeResult<T> = std::result::Result<T, TreeError>;

impl From<TreeError> for crate::Error {
    fn from(e: TreeError) -> Self {
        let kind = match &e {
            TreeError::DuplicatePath(_) | TreeError::DuplicateInterface(_) => crate::ErrorKind::AlreadyExists,
            TreeError::UnknownPath(_) | TreeError::UnknownInterface(..) | TreeError::UnknownProperty(..) => crate::ErrorKind::NotFound,
        };
        crate::Error::new(kind, e.to_string())
    }
}

/// The arena-backed GATT object tree. Mutable only while configurators run;
/// read-only (shared by reference) once the server reaches `Running`.
#[derive(Debug)]
pub struct Tree {
    nodes: Vec<Node>,
    root: NodeId,
}

impl Tree {
    /// Creates a tree whose root is the unpublished internal object-manager
    /// node at `root_path`, carrying the `ObjectManager` interface.
    pub fn new(root_path: ObjectPath) -> Self {
        let mut nodes = vec![Node::new(root_path, None, false)];
        nodes[0].interfaces.push(Interface::new(InterfaceKind::ObjectManager));
        Self { nodes, root: NodeId(0) }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0]
    }

    pub fn path_of(&self, id: NodeId) -> &ObjectPath {
        &self.nodes[id.0].path
    }

    /// Appends a uniquely-named, published child under `parent`.
    pub fn add_child(&mut self, parent: NodeId, name: &str) -> TreeResult<NodeId> {
        self.add_child_inner(parent, name, true)
    }

    /// Appends a uniquely-named, unpublished child under `parent`. Used for
    /// structural nodes that never contribute to `GetManagedObjects` output.
    pub fn add_internal_child(&mut self, parent: NodeId, name: &str) -> TreeResult<NodeId> {
        self.add_child_inner(parent, name, false)
    }

    fn add_child_inner(&mut self, parent: NodeId, name: &str, published: bool) -> TreeResult<NodeId> {
        if self.nodes[parent.0].children.iter().any(|(n, _)| n == name) {
            return Err(TreeError::DuplicatePath(name.to_string()));
        }
        let path = self.nodes[parent.0]
            .path
            .append(name)
            .map_err(|_| TreeError::DuplicatePath(name.to_string()))?;
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node::new(path, Some(parent), published));
        self.nodes[parent.0].children.push((name.to_string(), id));
        Ok(id)
    }

    pub fn child(&self, parent: NodeId, name: &str) -> Option<NodeId> {
        self.nodes[parent.0].children.iter().find(|(n, _)| n == name).map(|(_, id)| *id)
    }

    /// Attaches an interface to a node; a node may hold at most one
    /// interface of each kind.
    pub fn add_interface(&mut self, node: NodeId, interface: Interface) -> TreeResult<()> {
        if self.nodes[node.0].interfaces.iter().any(|i| i.kind == interface.kind) {
            return Err(TreeError::DuplicateInterface(interface.kind.dbus_name()));
        }
        self.nodes[node.0].interfaces.push(interface);
        Ok(())
    }

    fn find_node(&self, path: &ObjectPath) -> Option<NodeId> {
        self.nodes.iter().position(|n| &n.path == path).map(NodeId)
    }

    /// Resolves an object path to its node, if any node in the tree is
    /// published at that exact path. Used by the publisher to answer
    /// `org.freedesktop.DBus.Introspectable.Introspect` for a given path.
    pub fn node_id_at(&self, path: &ObjectPath) -> Option<NodeId> {
        self.find_node(path)
    }

    pub fn find_interface(&self, path: &ObjectPath, iface_name: &str) -> Option<&Interface> {
        let id = self.find_node(path)?;
        self.nodes[id.0].interfaces.iter().find(|i| i.name() == iface_name)
    }

    pub fn find_property(&self, path: &ObjectPath, iface_name: &str, prop_name: &str) -> Option<&Property> {
        self.find_interface(path, iface_name)?.property(prop_name)
    }

    /// Invokes the named method with decoded arguments. Returns `Ok(None)`
    /// iff no matching handler exists (the caller maps this to an
    /// `UnknownMethod` D-Bus error); the handler itself is responsible for
    /// completing the invocation via its returned `HandlerResult`.
    pub fn call_method(
        &self, path: &ObjectPath, iface_name: &str, method_name: &str, args: Vec<Value>,
    ) -> Option<HandlerResult<Value>> {
        let method = self.find_interface(path, iface_name)?.method(method_name)?;
        Some((method.handler)(args))
    }

    /// Enumerates every published node in stable pre-order, mapping object
    /// path to interface name to property name to current value. Used to
    /// answer `GetManagedObjects`.
    pub fn managed_objects(&self) -> BTreeMap<String, BTreeMap<&'static str, BTreeMap<String, Value>>> {
        let mut out = BTreeMap::new();
        let mut stack = vec![self.root];
        let mut order = Vec::new();
        while let Some(id) = stack.pop() {
            order.push(id);
            for (_, child) in self.nodes[id.0].children.iter().rev() {
                stack.push(*child);
            }
        }
        order.reverse();
        for id in order {
            let node = &self.nodes[id.0];
            if !node.published {
                continue;
            }
            let mut ifaces = BTreeMap::new();
            for iface in &node.interfaces {
                if iface.kind == InterfaceKind::ObjectManager {
                    continue;
                }
                let mut props = BTreeMap::new();
                for p in &iface.properties {
                    if let Some(get) = &p.get {
                        if let Ok(v) = get() {
                            props.insert(p.name.clone(), v);
                        }
                    }
                }
                ifaces.insert(iface.name(), props);
            }
            if !ifaces.is_empty() {
                out.insert(node.path.as_str().to_string(), ifaces);
            }
        }
        out
    }

    /// Every `GattService1.UUID` currently attached anywhere in the tree, in
    /// node order. Used by the lifecycle's advertisement setup (component G)
    /// to decide which service UUIDs are eligible for the AD payload.
    pub fn service_uuids(&self) -> Vec<crate::uuid::GattUuid> {
        let mut out = Vec::new();
        for node in &self.nodes {
            for iface in &node.interfaces {
                if iface.kind != InterfaceKind::GattService {
                    continue;
                }
                if let Some(Property { get: Some(get), .. }) = iface.property("UUID") {
                    if let Ok(Value::Str(s)) = get() {
                        if let Ok(uuid) = crate::uuid::GattUuid::from_str_checked(&s) {
                            out.push(uuid);
                        }
                    }
                }
            }
        }
        out
    }

    /// All published node paths under (and including) `subtree_root` in
    /// stable pre-order, used by the publisher to know what to register.
    pub fn published_subtree(&self, subtree_root: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![subtree_root];
        while let Some(id) = stack.pop() {
            let node = &self.nodes[id.0];
            if node.published {
                out.push(id);
            }
            for (_, child) in node.children.iter().rev() {
                stack.push(*child);
            }
        }
        out.reverse();
        out
    }
}

/// A thread-safe cell holding the last-known value of a characteristic or
/// descriptor, shared between the configurator-supplied handlers and the
/// property getter the tree exposes.
#[derive(Debug, Default)]
pub struct ValueCell(Mutex<Vec<u8>>);

impl ValueCell {
    pub fn new(initial: Vec<u8>) -> Self {
        Self(Mutex::new(initial))
    }

    pub fn get(&self) -> Vec<u8> {
        self.0.lock().expect("ValueCell mutex poisoned").clone()
    }

    pub fn set(&self, value: Vec<u8>) {
        *self.0.lock().expect("ValueCell mutex poisoned") = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn svc_interface(uuid: &str) -> Interface {
        let mut iface = Interface::new(InterfaceKind::GattService);
        let uuid = uuid.to_string();
        iface.properties.push(Property::read_only("UUID", "s", move || Ok(Value::Str(uuid.clone()))));
        iface.properties.push(Property::read_only("Primary", "b", || Ok(Value::Bool(true))));
        iface
    }

    #[test]
    fn add_child_rejects_duplicates() {
        let mut tree = Tree::new(ObjectPath::parse("/com/bzperi").unwrap());
        let root = tree.root();
        tree.add_child(root, "battery").unwrap();
        assert_eq!(tree.add_child(root, "battery").unwrap_err(), TreeError::DuplicatePath("battery".into()));
    }

    #[test]
    fn add_interface_rejects_duplicate_kind() {
        let mut tree = Tree::new(ObjectPath::parse("/com/bzperi").unwrap());
        let root = tree.root();
        let svc = tree.add_child(root, "battery").unwrap();
        tree.add_interface(svc, svc_interface("180F")).unwrap();
        assert!(matches!(tree.add_interface(svc, svc_interface("180F")), Err(TreeError::DuplicateInterface(_))));
    }

    #[test]
    fn managed_objects_elides_unpublished_and_object_manager() {
        let mut tree = Tree::new(ObjectPath::parse("/com/bzperi").unwrap());
        let root = tree.root();
        let svc = tree.add_child(root, "battery").unwrap();
        tree.add_interface(svc, svc_interface("180F")).unwrap();
        let internal = tree.add_internal_child(root, "advertisement0").unwrap();
        tree.add_interface(internal, Interface::new(InterfaceKind::Advertisement)).unwrap();

        let mo = tree.managed_objects();
        assert!(!mo.contains_key("/com/bzperi"), "root ObjectManager node must not self-enumerate");
        assert!(!mo.contains_key("/com/bzperi/advertisement0"), "unpublished nodes are elided");
        assert!(mo.contains_key("/com/bzperi/battery"));
        assert_eq!(mo["/com/bzperi/battery"]["org.bluez.GattService1"]["UUID"], Value::Str("180F".into()));
    }

    #[test]
    fn service_uuids_collects_every_gatt_service() {
        let mut tree = Tree::new(ObjectPath::parse("/com/bzperi").unwrap());
        let root = tree.root();
        let battery = tree.add_child(root, "battery").unwrap();
        tree.add_interface(battery, svc_interface("0000180F-0000-1000-8000-00805F9B34FB")).unwrap();
        let device_info = tree.add_child(root, "device_info").unwrap();
        tree.add_interface(device_info, svc_interface("0000180A-0000-1000-8000-00805F9B34FB")).unwrap();

        let uuids = tree.service_uuids();
        assert_eq!(uuids.len(), 2);
        assert!(uuids.contains(&crate::uuid::GattUuid::from_u16(0x180F)));
        assert!(uuids.contains(&crate::uuid::GattUuid::from_u16(0x180A)));
    }

    #[test]
    fn find_property_walks_tree() {
        let mut tree = Tree::new(ObjectPath::parse("/com/bzperi").unwrap());
        let root = tree.root();
        let svc = tree.add_child(root, "battery").unwrap();
        tree.add_interface(svc, svc_interface("180F")).unwrap();
        let path = tree.path_of(svc).clone();
        assert!(tree.find_property(&path, "org.bluez.GattService1", "UUID").is_some());
        assert!(tree.find_property(&path, "org.bluez.GattService1", "Nope").is_none());
        assert!(tree.find_interface(&path, "org.bluez.Nope1").is_none());
    }
}
