//! The LE advertisement tree node (component B variant) and its payload
//! budget policy (component F).
//!
//! Grounded on the older sibling crate's `adv.rs` `Advertisement` struct and
//! `register_interface` method, trimmed to the three properties spec
//! §3.1/§6.1 actually name (`Type`, `ServiceUUIDs`, `Includes`), plus the
//! 31-byte legacy AD budget policy of spec §3.2/§4.F grounded on
//! `ServerConfig::budget_advertised_uuids` (`config.rs`).

use crate::{
    config::budget_advertised_uuids,
    tree::{Interface, InterfaceKind, Property},
    uuid::GattUuid,
    value::Value,
};

/// `"peripheral"` or `"broadcast"` — this crate only ever advertises as a
/// connectable peripheral.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AdvertisementType {
    Peripheral,
    Broadcast,
}

impl AdvertisementType {
    fn as_str(self) -> &'static str {
        match self {
            AdvertisementType::Peripheral => "peripheral",
            AdvertisementType::Broadcast => "broadcast",
        }
    }
}

/// The subset of `Includes` this crate ever sets: `local-name` is always on
/// (surfaced via the adapter's `Alias`); `tx-power` defaults off.
#[derive(Clone, Copy, Debug, Default)]
pub struct AdvertisementIncludes {
    pub tx_power: bool,
}

/// Builds the `org.bluez.LEAdvertisement1` interface for the advertisement
/// node. `service_uuids` is the full set of service UUIDs the peripheral
/// exposes; only the 16-bit-representable ones that fit the legacy 31-byte
/// AD budget are advertised (custom 128-bit UUIDs are dropped from AD first,
/// per spec §3.2, though they remain discoverable via GATT once connected).
pub fn build_advertisement_interface(
    ty: AdvertisementType,
    service_uuids: &[GattUuid],
    includes: AdvertisementIncludes,
    local_name: Option<String>,
) -> Interface {
    let mut iface = Interface::new(InterfaceKind::Advertisement);

    iface.properties.push(Property::read_only("Type", "s", move || Ok(Value::Str(ty.as_str().to_string()))));

    let short_uuids: Vec<u16> = service_uuids.iter().filter_map(GattUuid::as_u16).collect();
    let advertised = budget_advertised_uuids(&short_uuids);
    iface.properties.push(Property::read_only("ServiceUUIDs", "as", move || {
        Ok(Value::Array(advertised.iter().map(|u| Value::Str(format!("{u:04X}"))).collect()))
    }));

    if let Some(name) = local_name {
        iface.properties.push(Property::read_only("LocalName", "s", move || Ok(Value::Str(name.clone()))));
    }

    iface.properties.push(Property::read_only("Includes", "as", move || {
        let mut v = vec![Value::Str("local-name".to_string())];
        if includes.tx_power {
            v.push(Value::Str("tx-power".to_string()));
        }
        Ok(Value::Array(v))
    }));

    iface.methods.push(crate::tree::Method {
        name: "Release".to_string(),
        in_signature: vec![],
        out_signature: "",
        handler: std::sync::Arc::new(|_args| Ok(Value::Bool(true))),
    });

    iface
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drops_128_bit_uuids_from_advertised_list_over_budget() {
        let custom = GattUuid::from_str_checked("12345678-1234-5678-1234-56789abcdef0").unwrap();
        let short: Vec<GattUuid> = (0u16..20).map(GattUuid::from_u16).chain(std::iter::once(custom)).collect();
        let iface = build_advertisement_interface(AdvertisementType::Peripheral, &short, AdvertisementIncludes::default(), None);
        let prop = iface.property("ServiceUUIDs").unwrap();
        let Value::Array(items) = (prop.get.as_ref().unwrap())().unwrap() else { panic!("expected array") };
        assert_eq!(items.len(), 14);
        assert!(items.iter().all(|v| matches!(v, Value::Str(s) if s.len() == 4)));
    }

    #[test]
    fn includes_always_has_local_name() {
        let iface = build_advertisement_interface(AdvertisementType::Peripheral, &[], AdvertisementIncludes::default(), None);
        let prop = iface.property("Includes").unwrap();
        let Value::Array(items) = (prop.get.as_ref().unwrap())().unwrap() else { panic!("expected array") };
        assert_eq!(items, vec![Value::Str("local-name".to_string())]);
    }

    #[test]
    fn local_name_property_present_when_set() {
        let iface = build_advertisement_interface(
            AdvertisementType::Peripheral,
            &[],
            AdvertisementIncludes::default(),
            Some("bz-periph".to_string()),
        );
        let prop = iface.property("LocalName").unwrap();
        let Value::Str(name) = (prop.get.as_ref().unwrap())().unwrap() else { panic!("expected string") };
        assert_eq!(name, "bz-periph");
    }

    #[test]
    fn local_name_property_absent_when_unset() {
        let iface = build_advertisement_interface(AdvertisementType::Peripheral, &[], AdvertisementIncludes::default(), None);
        assert!(iface.property("LocalName").is_none());
    }
}
