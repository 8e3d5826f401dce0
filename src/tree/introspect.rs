//! Standard D-Bus introspection XML emission for a subtree.

use std::fmt::Write as _;

use super::{NodeId, Tree};

const DOCTYPE: &str = r#"<!DOCTYPE node PUBLIC "-//freedesktop//DTD D-BUS Object Introspection 1.1//EN"
"http://www.freedesktop.org/standards/dbus/1.0/introspect.dtd">
"#;

/// Recursively emits introspection XML for the subtree rooted at `id`,
/// including `org.freedesktop.DBus.ObjectManager` on the root only (that
/// interface is attached exclusively to the tree's root node, so no special
/// casing is needed here beyond walking `node.interfaces` as given).
pub fn generate_introspection_xml(tree: &Tree, id: NodeId) -> String {
    let mut out = String::new();
    out.push_str(DOCTYPE);
    write_node(tree, id, &mut out);
    out
}

fn write_node(tree: &Tree, id: NodeId, out: &mut String) {
    let node = tree.node(id);
    writeln!(out, "<node>").unwrap();

    writeln!(out, "  <interface name=\"org.freedesktop.DBus.Properties\">").unwrap();
    writeln!(out, "    <method name=\"Get\">").unwrap();
    writeln!(out, "      <arg name=\"interface\" type=\"s\" direction=\"in\"/>").unwrap();
    writeln!(out, "      <arg name=\"name\" type=\"s\" direction=\"in\"/>").unwrap();
    writeln!(out, "      <arg name=\"value\" type=\"v\" direction=\"out\"/>").unwrap();
    writeln!(out, "    </method>").unwrap();
    writeln!(out, "    <method name=\"GetAll\">").unwrap();
    writeln!(out, "      <arg name=\"interface\" type=\"s\" direction=\"in\"/>").unwrap();
    writeln!(out, "      <arg name=\"properties\" type=\"a{{sv}}\" direction=\"out\"/>").unwrap();
    writeln!(out, "    </method>").unwrap();
    writeln!(out, "    <method name=\"Set\">").unwrap();
    writeln!(out, "      <arg name=\"interface\" type=\"s\" direction=\"in\"/>").unwrap();
    writeln!(out, "      <arg name=\"name\" type=\"s\" direction=\"in\"/>").unwrap();
    writeln!(out, "      <arg name=\"value\" type=\"v\" direction=\"in\"/>").unwrap();
    writeln!(out, "    </method>").unwrap();
    writeln!(out, "    <signal name=\"PropertiesChanged\">").unwrap();
    writeln!(out, "      <arg name=\"interface\" type=\"s\"/>").unwrap();
    writeln!(out, "      <arg name=\"changed_properties\" type=\"a{{sv}}\"/>").unwrap();
    writeln!(out, "      <arg name=\"invalidated_properties\" type=\"as\"/>").unwrap();
    writeln!(out, "    </signal>").unwrap();
    writeln!(out, "  </interface>").unwrap();

    for iface in &node.interfaces {
        writeln!(out, "  <interface name=\"{}\">", iface.name()).unwrap();
        for m in &iface.methods {
            writeln!(out, "    <method name=\"{}\">", m.name).unwrap();
            for sig in &m.in_signature {
                writeln!(out, "      <arg type=\"{sig}\" direction=\"in\"/>").unwrap();
            }
            if !m.out_signature.is_empty() {
                writeln!(out, "      <arg type=\"{}\" direction=\"out\"/>", m.out_signature).unwrap();
            }
            writeln!(out, "    </method>").unwrap();
        }
        for p in &iface.properties {
            let access = match (p.get.is_some(), p.set.is_some()) {
                (true, true) => "readwrite",
                (true, false) => "read",
                (false, true) => "write",
                (false, false) => continue,
            };
            writeln!(out, "    <property name=\"{}\" type=\"{}\" access=\"{}\"/>", p.name, p.signature, access).unwrap();
        }
        for s in &iface.signals {
            writeln!(out, "    <signal name=\"{}\">", s.name).unwrap();
            for sig in &s.arg_signatures {
                writeln!(out, "      <arg type=\"{sig}\"/>").unwrap();
            }
            writeln!(out, "    </signal>").unwrap();
        }
        writeln!(out, "  </interface>").unwrap();
    }

    for (name, _) in &node.children {
        writeln!(out, "  <node name=\"{name}\"/>").unwrap();
    }

    writeln!(out, "</node>").unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        path::ObjectPath,
        tree::{Interface, InterfaceKind, Property},
        value::Value,
    };

    #[test]
    fn emits_interface_and_children() {
        let mut tree = Tree::new(ObjectPath::parse("/com/bzperi").unwrap());
        let root = tree.root();
        let svc = tree.add_child(root, "battery").unwrap();
        let mut iface = Interface::new(InterfaceKind::GattService);
        iface.properties.push(Property::read_only("UUID", "s", || Ok(Value::Str("180F".into()))));
        tree.add_interface(svc, iface).unwrap();

        let xml = generate_introspection_xml(&tree, root);
        assert!(xml.contains("<node name=\"battery\"/>"));

        let xml = generate_introspection_xml(&tree, svc);
        assert!(xml.contains("org.bluez.GattService1"));
        assert!(xml.contains("name=\"UUID\" type=\"s\" access=\"read\""));
    }
}
