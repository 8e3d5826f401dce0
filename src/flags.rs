//! GATT characteristic/descriptor access-policy flags.
//!
//! Grounded on the teacher's `define_flags!` macro (`lib.rs`) which expands
//! a named bool-per-flag struct with `as_vec`/`from_slice` D-Bus string-list
//! conversions; reimplemented here as a plain struct since the macro itself
//! is part of the teacher's `bluetoothd`-gated glue this crate does not
//! carry forward.

use std::collections::HashSet;

macro_rules! flag_struct {
    ($name:ident => { $($field:ident => $wire:expr),* $(,)? }) => {
        #[derive(Clone, Copy, Default, Debug, Eq, PartialEq)]
        pub struct $name {
            $(pub $field: bool,)*
        }

        impl $name {
            pub fn as_vec(&self) -> Vec<String> {
                let mut v = Vec::new();
                $(if self.$field { v.push($wire.to_string()); })*
                v
            }

            pub fn from_slice(v: &[String]) -> Self {
                let set: HashSet<&str> = v.iter().map(String::as_str).collect();
                let mut s = Self::default();
                $(if set.contains($wire) { s.$field = true; })*
                s
            }
        }
    };
}

flag_struct!(CharacteristicFlags => {
    read => "read",
    write => "write",
    write_without_response => "write-without-response",
    notify => "notify",
    indicate => "indicate",
    authenticated_signed_writes => "authenticated-signed-writes",
    encrypt_read => "encrypt-read",
    encrypt_write => "encrypt-write",
    encrypt_authenticated_read => "encrypt-authenticated-read",
    encrypt_authenticated_write => "encrypt-authenticated-write",
    secure_read => "secure-read",
    secure_write => "secure-write",
});

impl CharacteristicFlags {
    pub fn notifiable(&self) -> bool {
        self.notify || self.indicate
    }
}

flag_struct!(DescriptorFlags => {
    read => "read",
    write => "write",
    authenticated_signed_writes => "authenticated-signed-writes",
    encrypt_read => "encrypt-read",
    encrypt_write => "encrypt-write",
    encrypt_authenticated_read => "encrypt-authenticated-read",
    encrypt_authenticated_write => "encrypt-authenticated-write",
    secure_read => "secure-read",
    secure_write => "secure-write",
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_wire_strings() {
        let f = CharacteristicFlags { read: true, notify: true, ..Default::default() };
        let wire = f.as_vec();
        assert_eq!(wire, vec!["read".to_string(), "notify".to_string()]);
        assert_eq!(CharacteristicFlags::from_slice(&wire), f);
        assert!(f.notifiable());
    }

    #[test]
    fn descriptor_flags_omit_notify_indicate() {
        let f = DescriptorFlags::from_slice(&["read".to_string(), "write".to_string()]);
        assert!(f.read && f.write);
    }
}
