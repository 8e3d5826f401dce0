//! The D-Bus publisher (component D): owns the bus connection and
//! well-known name, registers every published tree node under the system
//! bus, dispatches inbound method calls and property get/set back into the
//! tree, and emits `PropertiesChanged` for outbound notifications.
//!
//! Grounded on the teacher's `Session::new` (connection + `Crossroads` setup)
//! and `gatt/local.rs`'s per-interface `register_interface` methods, but
//! generalised: instead of one hand-written `IfaceToken` per concrete Rust
//! struct, bzperi registers exactly one generic `IfaceToken` per
//! [`InterfaceKind`] and dispatches through the tree at the object path
//! carried by the crossroads `Context`, since the set of nodes is built at
//! runtime by the configurator DSL rather than known at compile time.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use dbus::{
    arg::{PropMap, RefArg, Variant},
    channel::MatchingReceiver,
    message::MatchRule,
    nonblock::SyncConnection,
};
use dbus_crossroads::Crossroads;
use futures::lock::Mutex as AsyncMutex;
use std::sync::RwLock;

use crate::{
    path::ObjectPath,
    tree::{introspect, HandlerError, InterfaceKind, Tree},
    value::Value,
    Error, ErrorKind, Result,
};

/// Converts a [`Value`] into the boxed `RefArg` the `dbus` crate's arg
/// encoder expects.
pub fn value_to_refarg(v: &Value) -> Box<dyn RefArg> {
    match v {
        Value::Bool(b) => Box::new(*b),
        Value::U8(n) => Box::new(*n),
        Value::U16(n) => Box::new(*n),
        Value::U32(n) => Box::new(*n),
        Value::I16(n) => Box::new(*n),
        Value::I32(n) => Box::new(*n),
        Value::U64(n) => Box::new(*n),
        Value::I64(n) => Box::new(*n),
        Value::F64(n) => Box::new(*n),
        Value::Str(s) => Box::new(s.clone()),
        Value::ObjectPath(p) => Box::new(dbus::Path::from(p)),
        Value::Signature(s) => Box::new(dbus::Signature::new(s.clone()).unwrap_or_else(|_| dbus::Signature::new("v").unwrap())),
        Value::Bytes(b) => Box::new(b.clone()),
        Value::Array(items) => Box::new(items.iter().map(value_to_refarg).collect::<Vec<_>>()),
        Value::Dict(map) => {
            let pm: PropMap = map.iter().map(|(k, v)| (k.clone(), Variant(value_to_refarg(v)))).collect();
            Box::new(pm)
        }
        Value::Variant(inner) => Box::new(Variant(value_to_refarg(inner))),
        Value::Tuple(items) => Box::new(items.iter().map(value_to_refarg).collect::<Vec<_>>()),
    }
}

/// Best-effort decode of an inbound `a{sv}` options dict into a `Value`
/// (method options such as `ReadValue`'s/`WriteValue`'s `offset`/`device`
/// are exposed to handlers but unused by the tree itself).
pub fn propmap_to_value(pm: &PropMap) -> Value {
    let mut out = BTreeMap::new();
    for (k, v) in pm {
        if let Some(s) = v.as_str() {
            out.insert(k.clone(), Value::Str(s.to_string()));
        } else if let Some(n) = v.as_u64() {
            out.insert(k.clone(), Value::U64(n));
        } else if let Some(n) = v.as_i64() {
            out.insert(k.clone(), Value::I64(n));
        }
    }
    Value::Dict(out)
}

impl From<HandlerError> for dbus::MethodErr {
    fn from(e: HandlerError) -> Self {
        match e {
            HandlerError::NotPermitted => dbus::MethodErr::failed_with_name("org.bluez.Error.NotPermitted", "not permitted"),
            HandlerError::NotAuthorized => dbus::MethodErr::failed_with_name("org.bluez.Error.NotAuthorized", "not authorized"),
            HandlerError::InvalidValueLength => dbus::MethodErr::failed_with_name("org.bluez.Error.InvalidValueLength", "invalid value length"),
            HandlerError::InProgress => dbus::MethodErr::failed_with_name("org.bluez.Error.InProgress", "operation in progress"),
            HandlerError::NotSupported => dbus::MethodErr::failed_with_name("org.bluez.Error.NotSupported", "not supported"),
            HandlerError::Failed(msg) => dbus::MethodErr::failed_with_name("org.bluez.Error.Failed", &msg),
        }
    }
}

trait MethodErrExt {
    fn failed_with_name(name: &str, msg: &str) -> Self;
}

impl MethodErrExt for dbus::MethodErr {
    fn failed_with_name(name: &str, msg: &str) -> Self {
        dbus::MethodErr::from((name, msg))
    }
}

fn path_of(ctx: &dbus_crossroads::Context) -> Result<ObjectPath> {
    ObjectPath::parse(&ctx.path().to_string()).map_err(|_| Error::new(ErrorKind::InvalidPath, "dbus delivered an unparseable path"))
}

/// The D-Bus publisher. Holds the shared connection, the crossroads
/// dispatcher, and a read-mostly handle onto the tree it publishes.
pub struct Publisher {
    pub connection: Arc<SyncConnection>,
    crossroads: Arc<AsyncMutex<Crossroads>>,
    tree: Arc<RwLock<Tree>>,
}

impl Publisher {
    /// Connects to the system bus and builds a `Crossroads` with async
    /// support wired to `tokio::spawn`, mirroring `Session::new`.
    pub async fn connect(tree: Arc<RwLock<Tree>>) -> Result<Self> {
        let (resource, connection) = dbus_tokio::connection::new_system_sync()
            .map_err(|e| Error::new(ErrorKind::BusUnavailable, e.to_string()))?;
        tokio::spawn(async move {
            let err = resource.await;
            log::error!("D-Bus connection lost: {err}");
        });

        let mut crossroads = Crossroads::new();
        crossroads.set_async_support(Some((
            connection.clone(),
            Box::new(|x| {
                tokio::spawn(x);
            }),
        )));
        register_interfaces(&mut crossroads, tree.clone());

        let crossroads = Arc::new(AsyncMutex::new(crossroads));
        let cr_task = crossroads.clone();
        let conn_task = connection.clone();
        connection.start_receive(
            MatchRule::new_method_call(),
            Box::new(move |msg, conn| {
                let cr_task = cr_task.clone();
                let conn = conn.clone();
                tokio::spawn(async move {
                    let mut cr = cr_task.lock().await;
                    let _ = cr.handle_message(msg, &conn);
                });
                true
            }),
        );
        let _ = conn_task;

        Ok(Self { connection, crossroads, tree })
    }

    /// Requests the well-known bus name. Fails with `NameLost` if BlueZ (or
    /// anyone else) already owns it and refuses to release it.
    pub async fn acquire_name(&self, name: &str) -> Result<()> {
        self.connection
            .request_name(name, false, true, false)
            .await
            .map_err(|e| Error::new(ErrorKind::NameLost, e.to_string()))?;
        Ok(())
    }

    /// Publishes every node in the subtree rooted at `root` that the tree
    /// marks as contributing interfaces, inserting each at its object path
    /// with the tokens matching the interface kinds it carries, plus
    /// `org.freedesktop.DBus.Introspectable` (every node gets it via
    /// `Tokens::tokens_for`), which serves XML synthesised on demand by
    /// `tree::introspect::generate_introspection_xml` rather than pre-baked
    /// here.
    pub async fn register_tree(&self, root: crate::tree::NodeId) -> Result<()> {
        let tree = self.tree.read().expect("tree lock poisoned");
        let mut cr = self.crossroads.lock().await;
        for id in tree.published_subtree(root) {
            let node = tree.node(id);
            let path: dbus::Path<'static> = node.path.clone().into();
            let tokens = TOKENS.get().expect("register_interfaces runs before register_tree").tokens_for(node);
            cr.insert(path, &tokens, ());
        }
        // The object-manager node itself (unpublished, root of the whole
        // tree) is always registered so `GetManagedObjects` resolves.
        let root_path: dbus::Path<'static> = tree.path_of(tree.root()).clone().into();
        let tokens = TOKENS.get().unwrap();
        cr.insert(root_path, &[tokens.object_manager, tokens.introspectable], ());
        Ok(())
    }

    /// Publishes a single node regardless of its `published` flag — used for
    /// the advertisement node, which must answer D-Bus calls at its own
    /// object path but must never appear in `GetManagedObjects`.
    pub async fn register_node(&self, id: crate::tree::NodeId) -> Result<()> {
        let tree = self.tree.read().expect("tree lock poisoned");
        let mut cr = self.crossroads.lock().await;
        let node = tree.node(id);
        let path: dbus::Path<'static> = node.path.clone().into();
        let tokens = TOKENS.get().expect("register_interfaces runs before register_node").tokens_for(node);
        cr.insert(path, &tokens, ());
        Ok(())
    }

    /// Emits `org.freedesktop.DBus.Properties.PropertiesChanged` with
    /// `invalidated` always empty, per spec §4.D.
    pub fn emit_properties_changed(&self, path: &ObjectPath, interface: &str, changed: BTreeMap<String, Value>) -> Result<()> {
        use dbus::{arg::Variant, message::SignalArgs};
        let changed_properties: PropMap = changed.into_iter().map(|(k, v)| (k, Variant(value_to_refarg(&v)))).collect();
        let signal = dbus::nonblock::stdintf::org_freedesktop_dbus::PropertiesPropertiesChanged {
            interface_name: interface.to_string(),
            changed_properties,
            invalidated_properties: Vec::new(),
        };
        let msg = signal.to_emit_message(&path.clone().into());
        self.connection.send(msg).map_err(|_| Error::new(ErrorKind::Failed, "failed to send PropertiesChanged"))?;
        Ok(())
    }
}

/// Global, process-wide token set: built once on the first `Publisher`
/// connection (crossroads interface registration is inherently global, not
/// per-instance — mirrors the teacher's own one-token-per-interface-kind
/// registration in `Session::new`).
struct Tokens {
    object_manager: dbus_crossroads::IfaceToken<()>,
    gatt_service: dbus_crossroads::IfaceToken<()>,
    gatt_characteristic: dbus_crossroads::IfaceToken<()>,
    gatt_descriptor: dbus_crossroads::IfaceToken<()>,
    advertisement: dbus_crossroads::IfaceToken<()>,
    introspectable: dbus_crossroads::IfaceToken<()>,
}

impl Tokens {
    /// Every node gets `org.freedesktop.DBus.Introspectable` in addition to
    /// whatever per-`InterfaceKind` tokens it carries, so
    /// `generate_introspection_xml` (tree/introspect.rs) answers `Introspect`
    /// at every published path rather than relying solely on crossroads's
    /// own built-in introspection renderer.
    fn tokens_for(&self, node: &crate::tree::Node) -> Vec<dbus_crossroads::IfaceToken<()>> {
        let mut tokens: Vec<dbus_crossroads::IfaceToken<()>> = node
            .interfaces
            .iter()
            .map(|i| match i.kind {
                InterfaceKind::GattService => self.gatt_service,
                InterfaceKind::GattCharacteristic => self.gatt_characteristic,
                InterfaceKind::GattDescriptor => self.gatt_descriptor,
                InterfaceKind::ObjectManager => self.object_manager,
                InterfaceKind::Advertisement => self.advertisement,
            })
            .collect();
        tokens.push(self.introspectable);
        tokens
    }
}

static TOKENS: std::sync::OnceLock<Tokens> = std::sync::OnceLock::new();

fn register_interfaces(cr: &mut Crossroads, tree: Arc<RwLock<Tree>>) {
    TOKENS.get_or_init(|| {
        let object_manager = {
            let tree = tree.clone();
            cr.register("org.freedesktop.DBus.ObjectManager", move |ib| {
                let tree = tree.clone();
                ib.method_with_cr_async("GetManagedObjects", (), ("objects",), move |mut ctx, _cr, ()| {
                    let tree = tree.clone();
                    async move {
                        let tree = tree.read().expect("tree lock poisoned");
                        let mut out: HashMap<dbus::Path<'static>, HashMap<String, PropMap>> = HashMap::new();
                        for (path, ifaces) in tree.managed_objects() {
                            let p = dbus::Path::new(path).expect("tree paths are always valid");
                            let mut ifmap = HashMap::new();
                            for (iface_name, props) in ifaces {
                                let pm: PropMap = props.into_iter().map(|(k, v)| (k, Variant(value_to_refarg(&v)))).collect();
                                ifmap.insert(iface_name.to_string(), pm);
                            }
                            out.insert(p, ifmap);
                        }
                        ctx.reply(Ok((out,)))
                    }
                });
            })
        };

        let gatt_service = register_property_only_interface(cr, tree.clone(), "org.bluez.GattService1", &["UUID", "Primary"]);
        let gatt_descriptor = register_descriptor_interface(cr, tree.clone());
        let gatt_characteristic = register_characteristic_interface(cr, tree.clone());
        let advertisement = register_advertisement_interface(cr, tree.clone());
        let introspectable = register_introspectable_interface(cr, tree.clone());

        Tokens { object_manager, gatt_service, gatt_characteristic, gatt_descriptor, advertisement, introspectable }
    });
}

/// Registers `org.freedesktop.DBus.Introspectable`, synthesising the XML via
/// `tree::introspect::generate_introspection_xml` for whichever node lives at
/// the request path, rather than leaning on crossroads's own introspection
/// renderer (which only knows about registered interfaces, not this tree's
/// node/child structure).
fn register_introspectable_interface(cr: &mut Crossroads, tree: Arc<RwLock<Tree>>) -> dbus_crossroads::IfaceToken<()> {
    cr.register("org.freedesktop.DBus.Introspectable", move |ib| {
        let tree = tree.clone();
        ib.method_with_cr_async("Introspect", (), ("xml",), move |mut ctx, _cr, ()| {
            let tree = tree.clone();
            async move {
                let path = match path_of(&ctx) {
                    Ok(p) => p,
                    Err(e) => return ctx.reply(Err(dbus::MethodErr::failed(&e.to_string()))),
                };
                let tree = tree.read().expect("tree lock poisoned");
                match tree.node_id_at(&path) {
                    Some(id) => ctx.reply(Ok((introspect::generate_introspection_xml(&tree, id),))),
                    None => ctx.reply(Err(dbus::MethodErr::failed("no such object"))),
                }
            }
        });
    })
}

fn register_property_only_interface(
    cr: &mut Crossroads, tree: Arc<RwLock<Tree>>, name: &'static str, prop_names: &'static [&'static str],
) -> dbus_crossroads::IfaceToken<()> {
    cr.register(name, move |ib| {
        for prop_name in prop_names {
            let tree = tree.clone();
            ib.property(*prop_name).get(move |ctx, _| {
                let tree = tree.read().expect("tree lock poisoned");
                let path = ObjectPath::parse(&ctx.path().to_string()).map_err(|_| dbus::MethodErr::invalid_arg("path"))?;
                let prop = tree.find_property(&path, name, prop_name).ok_or_else(|| dbus::MethodErr::no_property(prop_name))?;
                let get = prop.get.as_ref().ok_or_else(|| dbus::MethodErr::failed("not readable"))?;
                get().map_err(Into::into)
            });
        }
    })
}

fn register_descriptor_interface(cr: &mut Crossroads, tree: Arc<RwLock<Tree>>) -> dbus_crossroads::IfaceToken<()> {
    const IFACE: &str = "org.bluez.GattDescriptor1";
    cr.register(IFACE, move |ib| {
        for prop_name in ["UUID", "Characteristic", "Flags"] {
            let tree = tree.clone();
            ib.property(prop_name).get(move |ctx, _| {
                let tree = tree.read().expect("tree lock poisoned");
                let path = path_of_ctx(ctx)?;
                let prop = tree.find_property(&path, IFACE, prop_name).ok_or_else(|| dbus::MethodErr::no_property(prop_name))?;
                prop.get.as_ref().ok_or_else(|| dbus::MethodErr::failed("not readable"))?().map_err(Into::into)
            });
        }

        let t = tree.clone();
        ib.method_with_cr_async("ReadValue", ("options",), ("value",), move |mut ctx, _cr, (options,): (PropMap,)| {
            let tree = t.clone();
            async move {
                let result = async {
                    let tree = tree.read().expect("tree lock poisoned");
                    let path = path_of(&ctx)?;
                    let method = tree
                        .call_method(&path, IFACE, "ReadValue", vec![propmap_to_value(&options)])
                        .ok_or_else(|| Error::new(ErrorKind::NotFound, "no such descriptor"))?;
                    method.map_err(dbus::MethodErr::from).map_err(|e| Error::new(ErrorKind::Failed, e.to_string()))
                }
                .await;
                match result {
                    Ok(Value::Bytes(b)) => ctx.reply(Ok((b,))),
                    Ok(_) => ctx.reply(Err(dbus::MethodErr::failed("handler returned non-bytes value"))),
                    Err(e) => ctx.reply(Err(dbus::MethodErr::failed(&e.to_string()))),
                }
            }
        });

        let t = tree.clone();
        ib.method_with_cr_async("WriteValue", ("value", "options"), (), move |mut ctx, _cr, (value, options): (Vec<u8>, PropMap)| {
            let tree = t.clone();
            async move {
                let path = match path_of(&ctx) {
                    Ok(p) => p,
                    Err(e) => return ctx.reply(Err(dbus::MethodErr::failed(&e.to_string()))),
                };
                let tree = tree.read().expect("tree lock poisoned");
                match tree.call_method(&path, IFACE, "WriteValue", vec![Value::Bytes(value), propmap_to_value(&options)]) {
                    Some(Ok(_)) => ctx.reply(Ok(())),
                    Some(Err(e)) => ctx.reply(Err(e.into())),
                    None => ctx.reply(Err(dbus::MethodErr::failed("no such descriptor"))),
                }
            }
        });
    })
}

fn register_characteristic_interface(cr: &mut Crossroads, tree: Arc<RwLock<Tree>>) -> dbus_crossroads::IfaceToken<()> {
    const IFACE: &str = "org.bluez.GattCharacteristic1";
    cr.register(IFACE, move |ib| {
        for prop_name in ["UUID", "Service", "Flags", "Value"] {
            let tree = tree.clone();
            ib.property(prop_name).get(move |ctx, _| {
                let tree = tree.read().expect("tree lock poisoned");
                let path = path_of_ctx(ctx)?;
                match tree.find_property(&path, IFACE, prop_name) {
                    Some(prop) => match &prop.get {
                        Some(get) => get().map_err(Into::into),
                        None => Err(dbus::MethodErr::no_property(prop_name)),
                    },
                    None if prop_name == "Value" => Err(dbus::MethodErr::no_property("Value")),
                    None => Err(dbus::MethodErr::no_property(prop_name)),
                }
            });
        }

        let t = tree.clone();
        ib.method_with_cr_async("ReadValue", ("options",), ("value",), move |mut ctx, _cr, (options,): (PropMap,)| {
            let tree = t.clone();
            async move {
                let path = match path_of(&ctx) {
                    Ok(p) => p,
                    Err(e) => return ctx.reply(Err(dbus::MethodErr::failed(&e.to_string()))),
                };
                let tree = tree.read().expect("tree lock poisoned");
                match tree.call_method(&path, IFACE, "ReadValue", vec![propmap_to_value(&options)]) {
                    Some(Ok(Value::Bytes(b))) => ctx.reply(Ok((b,))),
                    Some(Ok(_)) => ctx.reply(Err(dbus::MethodErr::failed("handler returned non-bytes value"))),
                    Some(Err(e)) => ctx.reply(Err(e.into())),
                    None => ctx.reply(Err(dbus::MethodErr::failed("no such characteristic"))),
                }
            }
        });

        let t = tree.clone();
        ib.method_with_cr_async("WriteValue", ("value", "options"), (), move |mut ctx, _cr, (value, options): (Vec<u8>, PropMap)| {
            let tree = t.clone();
            async move {
                let path = match path_of(&ctx) {
                    Ok(p) => p,
                    Err(e) => return ctx.reply(Err(dbus::MethodErr::failed(&e.to_string()))),
                };
                let tree = tree.read().expect("tree lock poisoned");
                match tree.call_method(&path, IFACE, "WriteValue", vec![Value::Bytes(value), propmap_to_value(&options)]) {
                    Some(Ok(_)) => ctx.reply(Ok(())),
                    Some(Err(e)) => ctx.reply(Err(e.into())),
                    None => ctx.reply(Err(dbus::MethodErr::failed("no such characteristic"))),
                }
            }
        });

        let t = tree.clone();
        ib.method_with_cr_async("StartNotify", (), (), move |mut ctx, _cr, ()| {
            let tree = t.clone();
            async move {
                let path = match path_of(&ctx) {
                    Ok(p) => p,
                    Err(e) => return ctx.reply(Err(dbus::MethodErr::failed(&e.to_string()))),
                };
                let tree = tree.read().expect("tree lock poisoned");
                match tree.call_method(&path, IFACE, "StartNotify", vec![]) {
                    Some(Ok(_)) | None => ctx.reply(Ok(())),
                    Some(Err(e)) => ctx.reply(Err(e.into())),
                }
            }
        });

        let t = tree.clone();
        ib.method_with_cr_async("StopNotify", (), (), move |mut ctx, _cr, ()| {
            let tree = t.clone();
            async move {
                let path = match path_of(&ctx) {
                    Ok(p) => p,
                    Err(e) => return ctx.reply(Err(dbus::MethodErr::failed(&e.to_string()))),
                };
                let tree = tree.read().expect("tree lock poisoned");
                match tree.call_method(&path, IFACE, "StopNotify", vec![]) {
                    Some(Ok(_)) | None => ctx.reply(Ok(())),
                    Some(Err(e)) => ctx.reply(Err(e.into())),
                }
            }
        });
    })
}

fn register_advertisement_interface(cr: &mut Crossroads, tree: Arc<RwLock<Tree>>) -> dbus_crossroads::IfaceToken<()> {
    const IFACE: &str = "org.bluez.LEAdvertisement1";
    cr.register(IFACE, move |ib| {
        for prop_name in ["Type", "ServiceUUIDs", "Includes"] {
            let tree = tree.clone();
            ib.property(prop_name).get(move |ctx, _| {
                let tree = tree.read().expect("tree lock poisoned");
                let path = path_of_ctx(ctx)?;
                let prop = tree.find_property(&path, IFACE, prop_name).ok_or_else(|| dbus::MethodErr::no_property(prop_name))?;
                prop.get.as_ref().ok_or_else(|| dbus::MethodErr::failed("not readable"))?().map_err(Into::into)
            });
        }

        ib.method("Release", (), (), move |_ctx, _cr, (): ()| Ok(()));
    })
}

fn path_of_ctx(ctx: &mut dbus_crossroads::Context) -> std::result::Result<ObjectPath, dbus::MethodErr> {
    ObjectPath::parse(&ctx.path().to_string()).map_err(|_| dbus::MethodErr::invalid_arg("path"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_to_refarg_round_trips_bytes() {
        let v = Value::Bytes(vec![0x48, 0x69]);
        let refarg = value_to_refarg(&v);
        assert_eq!(refarg.as_iter().unwrap().map(|x| x.as_u64().unwrap() as u8).collect::<Vec<_>>(), vec![0x48, 0x69]);
    }

    #[test]
    fn value_to_refarg_handles_object_path() {
        let path = ObjectPath::parse("/com/bzperi/battery/level").unwrap();
        let refarg = value_to_refarg(&Value::ObjectPath(path));
        assert_eq!(refarg.as_str(), Some("/com/bzperi/battery/level"));
    }

    #[test]
    fn value_to_refarg_handles_nested_array_and_dict() {
        let mut dict = BTreeMap::new();
        dict.insert("Value".to_string(), Value::Bytes(vec![78]));
        let v = Value::Array(vec![Value::Str("a".into()), Value::Str("b".into())]);
        // smoke test: these must not panic while encoding.
        let _ = value_to_refarg(&v);
        let _ = value_to_refarg(&Value::Dict(dict));
    }

    #[test]
    fn propmap_to_value_decodes_strings() {
        let mut pm: PropMap = PropMap::new();
        pm.insert("device".to_string(), Variant(Box::new("/org/bluez/hci0/dev_00".to_string())));
        let decoded = propmap_to_value(&pm);
        let Value::Dict(map) = decoded else { panic!("expected dict") };
        assert_eq!(map.get("device"), Some(&Value::Str("/org/bluez/hci0/dev_00".to_string())));
    }

    #[test]
    fn handler_error_converts_to_method_err_without_panicking() {
        let err: dbus::MethodErr = HandlerError::NotSupported.into();
        assert!(format!("{err:?}").contains("NotSupported"));
    }
}
