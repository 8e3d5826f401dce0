//! The fluent, closure-nested configurator DSL (component C): builds the
//! GATT tree (component B) and maintains the process-wide list of
//! configurator callbacks applied once at `start` time.
//!
//! Grounded on the teacher's `Application { services: Vec<Service> }`
//! aggregate-then-register shape (`gatt/local.rs::Application::register`),
//! generalised into the closure-nested form spec §9 explicitly permits, and
//! on `dbus_crossroads::Crossroads`'s single-shared-state-under-mutex
//! pattern for the process-wide registry.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

use lazy_static::lazy_static;

use crate::{
    config::{DataGetter, DataSetter},
    flags::{CharacteristicFlags, DescriptorFlags},
    tree::{HandlerError, HandlerResult, Interface, InterfaceKind, Method, NodeId, Property, Tree, TreeResult, ValueCell},
    uuid::GattUuid,
    value::Value,
};

/// A configurator: a process-wide-registered callback that populates the
/// tree through a [`ServerBuilder`]. Takes `&mut ServerBuilder<'_>` rather
/// than owning it so it composes across an arbitrary borrow lifetime.
pub type Configurator = Arc<dyn for<'a> Fn(&mut ServerBuilder<'a>) + Send + Sync>;

lazy_static! {
    static ref CONFIGURATORS: Mutex<Vec<Configurator>> = Mutex::new(Vec::new());
}

/// Appends `configurator` to the process-wide list. Thread-safe.
pub fn register(configurator: Configurator) {
    CONFIGURATORS.lock().expect("configurator registry poisoned").push(configurator);
}

/// Removes every registered configurator. Only meaningful before `start`.
pub fn clear() {
    CONFIGURATORS.lock().expect("configurator registry poisoned").clear();
}

/// The number of currently registered configurators.
pub fn count() -> usize {
    CONFIGURATORS.lock().expect("configurator registry poisoned").len()
}

/// Snapshots the registry under the lock, drops the lock, then invokes each
/// snapshotted configurator against `builder`.
pub fn apply_all(builder: &mut ServerBuilder<'_>) {
    let snapshot: Vec<Configurator> = CONFIGURATORS.lock().expect("configurator registry poisoned").clone();
    for configurator in snapshot {
        configurator(builder);
    }
}

fn uuid_property(uuid: GattUuid) -> Property {
    let s = uuid.to_canonical_string();
    Property::read_only("UUID", "s", move || Ok(Value::Str(s.clone())))
}

fn flags_property(wire: Vec<String>) -> Property {
    Property::read_only("Flags", "as", move || Ok(Value::Array(wire.iter().cloned().map(Value::Str).collect())))
}

fn read_value_method(on_read: Option<Arc<dyn Fn() -> HandlerResult<Vec<u8>> + Send + Sync>>, cell: Arc<ValueCell>) -> Method {
    Method {
        name: "ReadValue".to_string(),
        in_signature: vec!["a{sv}"],
        out_signature: "ay",
        handler: Arc::new(move |_args| match &on_read {
            Some(f) => f().map(Value::Bytes),
            None => Ok(Value::Bytes(cell.get())),
        }),
    }
}

fn write_value_method(on_write: Option<Arc<dyn Fn(Vec<u8>) -> HandlerResult<()> + Send + Sync>>, cell: Arc<ValueCell>) -> Method {
    Method {
        name: "WriteValue".to_string(),
        in_signature: vec!["ay", "a{sv}"],
        out_signature: "",
        handler: Arc::new(move |args| {
            let bytes = args.first().and_then(Value::as_bytes).map(<[u8]>::to_vec).unwrap_or_default();
            if let Some(f) = &on_write {
                f(bytes.clone())?;
            }
            cell.set(bytes);
            Ok(Value::Bool(true))
        }),
    }
}

fn value_property(
    on_read: Option<Arc<dyn Fn() -> HandlerResult<Vec<u8>> + Send + Sync>>, cell: Arc<ValueCell>, notifiable: bool,
) -> Property {
    let get = move || match &on_read {
        Some(f) => f().map(Value::Bytes),
        None => Ok(Value::Bytes(cell.get())),
    };
    if notifiable {
        Property::notifying("Value", "ay", get)
    } else {
        Property::read_only("Value", "ay", get)
    }
}

/// The root builder scope passed to every configurator: owns a `&mut` into
/// the tree rooted at the server's published root node.
pub struct ServerBuilder<'a> {
    tree: &'a mut Tree,
    root: NodeId,
}

impl<'a> ServerBuilder<'a> {
    pub fn new(tree: &'a mut Tree, root: NodeId) -> Self {
        Self { tree, root }
    }

    /// Declares a GATT service (`Primary` defaults to `true`) under the
    /// server root, naming its D-Bus path slug and invoking `build` with a
    /// scoped [`ServiceBuilder`]. Fails with `DuplicatePath` if `slug` is
    /// already taken among the root's children.
    pub fn service(&mut self, slug: &str, uuid: GattUuid, build: impl FnOnce(&mut ServiceBuilder<'_>)) -> TreeResult<()> {
        let node = self.tree.add_child(self.root, slug)?;
        let mut iface = Interface::new(InterfaceKind::GattService);
        iface.properties.push(uuid_property(uuid));
        let primary = Arc::new(AtomicBool::new(true));
        {
            let primary = primary.clone();
            iface.properties.push(Property::read_only("Primary", "b", move || Ok(Value::Bool(primary.load(Ordering::Relaxed)))));
        }
        self.tree.add_interface(node, iface)?;
        build(&mut ServiceBuilder { tree: self.tree, node, primary });
        Ok(())
    }
}

/// Scoped builder for a single GATT service: declares characteristics under
/// it. The closure-nested form (spec §9) is used throughout instead of the
/// chained-`end()` alternative it also permits.
pub struct ServiceBuilder<'a> {
    tree: &'a mut Tree,
    node: NodeId,
    primary: Arc<AtomicBool>,
}

impl<'a> ServiceBuilder<'a> {
    /// Overrides `Primary` (defaults to `true`).
    pub fn primary(&mut self, primary: bool) -> &mut Self {
        self.primary.store(primary, Ordering::Relaxed);
        self
    }

    /// Declares a characteristic under this service.
    pub fn characteristic(
        &mut self, slug: &str, uuid: GattUuid, flags: CharacteristicFlags, build: impl FnOnce(&mut CharacteristicBuilder<'_>),
    ) -> TreeResult<()> {
        let node = self.tree.add_child(self.node, slug)?;
        let service_path = self.tree.path_of(self.node).clone();
        let cell = Arc::new(ValueCell::default());

        let mut c = CharacteristicBuilder {
            tree: self.tree,
            node,
            flags,
            cell: cell.clone(),
            on_read: None,
            on_write: None,
            notify_started: Arc::new(AtomicBool::new(false)),
        };
        build(&mut c);
        let CharacteristicBuilder { on_read, on_write, notify_started, .. } = c;

        let mut iface = Interface::new(InterfaceKind::GattCharacteristic);
        iface.properties.push(uuid_property(uuid));
        {
            let p = service_path;
            iface.properties.push(Property::read_only("Service", "o", move || Ok(Value::ObjectPath(p.clone()))));
        }
        iface.properties.push(flags_property(flags.as_vec()));
        iface.properties.push(value_property(on_read.clone(), cell.clone(), flags.notifiable()));
        iface.methods.push(read_value_method(on_read.clone(), cell.clone()));
        iface.methods.push(write_value_method(on_write, cell.clone()));
        iface.methods.push(notify_method("StartNotify", flags.notifiable(), notify_started.clone(), true));
        iface.methods.push(notify_method("StopNotify", flags.notifiable(), notify_started, false));

        self.tree.add_interface(node, iface)
    }
}

fn notify_method(name: &str, notifiable: bool, started: Arc<AtomicBool>, to: bool) -> Method {
    Method {
        name: name.to_string(),
        in_signature: vec![],
        out_signature: "",
        handler: Arc::new(move |_args| {
            if to && !notifiable {
                return Err(HandlerError::NotSupported);
            }
            started.store(to, Ordering::Relaxed);
            Ok(Value::Bool(true))
        }),
    }
}

/// Scoped builder for a single characteristic: registers handler slots and
/// internal descriptor children.
pub struct CharacteristicBuilder<'a> {
    tree: &'a mut Tree,
    node: NodeId,
    flags: CharacteristicFlags,
    cell: Arc<ValueCell>,
    on_read: Option<Arc<dyn Fn() -> HandlerResult<Vec<u8>> + Send + Sync>>,
    on_write: Option<Arc<dyn Fn(Vec<u8>) -> HandlerResult<()> + Send + Sync>>,
    notify_started: Arc<AtomicBool>,
}

impl<'a> CharacteristicBuilder<'a> {
    /// Installs a synchronous read handler. Overrides the value-cell
    /// default.
    pub fn on_read(&mut self, f: impl Fn() -> HandlerResult<Vec<u8>> + Send + Sync + 'static) -> &mut Self {
        self.on_read = Some(Arc::new(f));
        self
    }

    /// Installs a synchronous write handler, invoked before the new value is
    /// stored in the backing cell.
    pub fn on_write(&mut self, f: impl Fn(Vec<u8>) -> HandlerResult<()> + Send + Sync + 'static) -> &mut Self {
        self.on_write = Some(Arc::new(f));
        self
    }

    /// Seeds the initial value of the backing cell (used when no `on_read`
    /// is installed, or as the value `WriteValue` starts from).
    pub fn initial_value(&mut self, value: impl Into<Vec<u8>>) -> &mut Self {
        self.cell.set(value.into());
        self
    }

    /// A convenience wrapper binding `on_read`/`on_write` to the host's
    /// semantic data-access callbacks (spec §6.3) by `name`.
    pub fn bind_data(&mut self, name: impl Into<String>, getter: DataGetter, setter: DataSetter) -> &mut Self {
        let read_name = name.into();
        let write_name = read_name.clone();
        self.on_read = Some(Arc::new(move || getter(&read_name).ok_or(HandlerError::Failed("no data available".to_string()))));
        self.on_write = Some(Arc::new(move |bytes| {
            if setter(&write_name, &bytes) {
                Ok(())
            } else {
                Err(HandlerError::Failed("write rejected".to_string()))
            }
        }));
        self
    }

    /// Whether this characteristic's flags request notifications.
    pub fn notifiable(&self) -> bool {
        self.flags.notifiable()
    }

    /// The backing value cell, for a host that wants to push updates via
    /// the [`crate::queue::UpdateQueue`] after mutating it directly.
    pub fn value_cell(&self) -> Arc<ValueCell> {
        self.cell.clone()
    }

    /// Declares a descriptor under this characteristic.
    pub fn descriptor(
        &mut self, slug: &str, uuid: GattUuid, flags: DescriptorFlags, build: impl FnOnce(&mut DescriptorBuilder<'_>),
    ) -> TreeResult<()> {
        let node = self.tree.add_child(self.node, slug)?;
        let char_path = self.tree.path_of(self.node).clone();
        let cell = Arc::new(ValueCell::default());

        let mut d = DescriptorBuilder { cell: cell.clone(), on_read: None, on_write: None, _marker: std::marker::PhantomData };
        build(&mut d);
        let DescriptorBuilder { on_read, on_write, .. } = d;

        let mut iface = Interface::new(InterfaceKind::GattDescriptor);
        iface.properties.push(uuid_property(uuid));
        {
            let p = char_path;
            iface.properties.push(Property::read_only("Characteristic", "o", move || Ok(Value::ObjectPath(p.clone()))));
        }
        iface.properties.push(flags_property(flags.as_vec()));
        iface.methods.push(read_value_method(on_read, cell.clone()));
        iface.methods.push(write_value_method(on_write, cell));

        self.tree.add_interface(node, iface)
    }
}

/// Scoped builder for a single descriptor.
pub struct DescriptorBuilder<'a> {
    cell: Arc<ValueCell>,
    on_read: Option<Arc<dyn Fn() -> HandlerResult<Vec<u8>> + Send + Sync>>,
    on_write: Option<Arc<dyn Fn(Vec<u8>) -> HandlerResult<()> + Send + Sync>>,
    #[allow(dead_code)]
    _marker: std::marker::PhantomData<&'a ()>,
}

impl<'a> DescriptorBuilder<'a> {
    pub fn on_read(&mut self, f: impl Fn() -> HandlerResult<Vec<u8>> + Send + Sync + 'static) -> &mut Self {
        self.on_read = Some(Arc::new(f));
        self
    }

    pub fn on_write(&mut self, f: impl Fn(Vec<u8>) -> HandlerResult<()> + Send + Sync + 'static) -> &mut Self {
        self.on_write = Some(Arc::new(f));
        self
    }

    pub fn initial_value(&mut self, value: impl Into<Vec<u8>>) -> &mut Self {
        self.cell.set(value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::ObjectPath;

    #[test]
    fn registry_register_clear_count() {
        clear();
        assert_eq!(count(), 0);
        register(Arc::new(|_b: &mut ServerBuilder<'_>| {}));
        assert_eq!(count(), 1);
        clear();
        assert_eq!(count(), 0);
    }

    #[test]
    fn apply_all_builds_a_service() {
        clear();
        register(Arc::new(|b: &mut ServerBuilder<'_>| {
            b.service("device_info", GattUuid::from_u16(0x180A), |s| {
                s.characteristic("mfgr_name", GattUuid::from_u16(0x2A29), CharacteristicFlags { read: true, ..Default::default() }, |c| {
                    c.initial_value(b"Acme Inc.".to_vec());
                })
                .unwrap();
            })
            .unwrap();
        }));

        let mut tree = Tree::new(ObjectPath::parse("/com/bzperi").unwrap());
        let root = tree.root();
        {
            let mut builder = ServerBuilder::new(&mut tree, root);
            apply_all(&mut builder);
        }

        let path = ObjectPath::parse("/com/bzperi/device_info/mfgr_name").unwrap();
        let iface = tree.find_interface(&path, "org.bluez.GattCharacteristic1").unwrap();
        assert_eq!(iface.property("UUID").unwrap().get.as_ref().unwrap()().unwrap(), Value::Str("00002A29-0000-1000-8000-00805F9B34FB".into()));
        let read = tree.call_method(&path, "org.bluez.GattCharacteristic1", "ReadValue", vec![Value::Dict(Default::default())]).unwrap().unwrap();
        assert_eq!(read, Value::Bytes(b"Acme Inc.".to_vec()));
        clear();
    }

    #[test]
    fn duplicate_slug_fails_second_registration() {
        clear();
        let mut tree = Tree::new(ObjectPath::parse("/com/bzperi").unwrap());
        let root = tree.root();
        let mut builder = ServerBuilder::new(&mut tree, root);
        builder.service("battery", GattUuid::from_u16(0x180F), |_| {}).unwrap();
        assert!(builder.service("battery", GattUuid::from_u16(0x180F), |_| {}).is_err());
    }

    #[test]
    fn notify_flag_controls_start_notify() {
        clear();
        let mut tree = Tree::new(ObjectPath::parse("/com/bzperi").unwrap());
        let root = tree.root();
        let mut builder = ServerBuilder::new(&mut tree, root);
        builder
            .service("battery", GattUuid::from_u16(0x180F), |s| {
                s.characteristic("level", GattUuid::from_u16(0x2A19), CharacteristicFlags { read: true, ..Default::default() }, |c| {
                    c.initial_value(vec![78u8]);
                })
                .unwrap();
            })
            .unwrap();
        let path = ObjectPath::parse("/com/bzperi/battery/level").unwrap();
        let result = tree.call_method(&path, "org.bluez.GattCharacteristic1", "StartNotify", vec![]).unwrap();
        assert!(matches!(result, Err(HandlerError::NotSupported)));
    }

    #[test]
    fn descriptor_attaches_under_characteristic() {
        clear();
        let mut tree = Tree::new(ObjectPath::parse("/com/bzperi").unwrap());
        let root = tree.root();
        let mut builder = ServerBuilder::new(&mut tree, root);
        builder
            .service("text", GattUuid::from_u16(0x1800), |s| {
                s.characteristic(
                    "string",
                    GattUuid::from_str_checked("12345678-1234-5678-1234-56789abcdef0").unwrap(),
                    CharacteristicFlags { read: true, write: true, ..Default::default() },
                    |c| {
                        c.descriptor("user_desc", GattUuid::from_u16(0x2901), DescriptorFlags { read: true, ..Default::default() }, |d| {
                            d.initial_value(b"Text".to_vec());
                        })
                        .unwrap();
                    },
                )
                .unwrap();
            })
            .unwrap();
        let path = ObjectPath::parse("/com/bzperi/text/string/user_desc").unwrap();
        assert!(tree.find_interface(&path, "org.bluez.GattDescriptor1").is_some());
    }
}
