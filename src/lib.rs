//! Bluetooth LE Battery Service (BAS) client manager.
//!
//! This crate implements the server side of a platform Battery Service
//! manager. It discovers Battery Service instances on connected peers,
//! arbitrates notification subscriptions from multiple local and remote
//! clients, executes battery level and identification reads against the
//! remote GATT server, and persists per-device notification state across
//! reconnects, pairing changes, and address rotation.
//!
//! The GATT client, device directory, settings store, and IPC bus are
//! consumed as capability traits ([`gatt::Gatt`], [`dev::Directory`],
//! [`SettingsStore`], [`ipc::Bus`]), so the manager can sit on top of any
//! platform stack able to provide them.

#![warn(missing_debug_implementations)]
#![warn(non_ascii_idents)]
#![warn(single_use_lifetimes)]
#![warn(unused_crate_dependencies)]
#![warn(unused_extern_crates)]
#![warn(unused_import_braces)]
#![warn(unused_lifetimes)]
#![warn(unused_qualifications)]
#![warn(variant_size_differences)]
#![warn(clippy::cargo)]
#![warn(clippy::nursery)]
#![warn(clippy::pedantic)]
#![allow(clippy::enum_glob_use)]
#![allow(clippy::inline_always)]
#![allow(clippy::module_name_repetitions)]
// #![warn(clippy::restriction)]
#![warn(clippy::assertions_on_result_states)]
#![warn(clippy::clone_on_ref_ptr)]
#![warn(clippy::dbg_macro)]
#![warn(clippy::decimal_literal_representation)]
#![warn(clippy::deref_by_slicing)]
#![warn(clippy::empty_drop)]
#![warn(clippy::empty_structs_with_brackets)]
#![warn(clippy::exhaustive_enums)]
#![warn(clippy::exit)]
#![warn(clippy::fn_to_numeric_cast_any)]
#![warn(clippy::format_push_string)]
#![warn(clippy::get_unwrap)]
#![warn(clippy::if_then_some_else_none)]
#![warn(clippy::lossy_float_literal)]
#![warn(clippy::missing_enforced_import_renames)]
#![warn(clippy::mixed_read_write_in_expression)]
#![warn(clippy::mod_module_files)]
#![warn(clippy::mutex_atomic)]
#![warn(clippy::print_stdout)]
#![warn(clippy::rc_buffer)]
#![warn(clippy::rc_mutex)]
#![warn(clippy::rest_pat_in_fully_bound_structs)]
#![warn(clippy::str_to_string)]
#![warn(clippy::string_add)]
#![warn(clippy::string_to_string)]
#![warn(clippy::suspicious_xor_used_as_pow)]
#![warn(clippy::todo)]
#![warn(clippy::try_err)]
#![warn(clippy::undocumented_unsafe_blocks)]
#![warn(clippy::unnecessary_safety_comment)]
#![warn(clippy::unnecessary_safety_doc)]
#![warn(clippy::unnecessary_self_imports)]
#![warn(clippy::unneeded_field_pattern)]
#![warn(clippy::unseparated_literal_suffix)]

use std::fmt::Debug;

pub mod att;
pub mod dev;
#[path = "gap/gap.rs"]
pub mod gap;
#[path = "gatt/gatt.rs"]
pub mod gatt;
#[path = "ipc/ipc.rs"]
pub mod ipc;
pub mod le;
#[path = "server/server.rs"]
pub mod server;

pub use server::Server;

/// Non-async mutex types.
pub(crate) type SyncMutex<T> = parking_lot::Mutex<T>;
pub(crate) type SyncMutexGuard<'a, T> = parking_lot::MutexGuard<'a, T>;

/// Returns a string representation of the specified type.
macro_rules! name_of {
    ($t:ty) => {{
        // TODO: Switch to `std::any::type_name` when stabilized
        type _T = $t; // Allows $t to be recognized as a type for refactoring
        stringify!($t)
    }};
}
pub(crate) use name_of;

/// Implements `Display` in terms of `Debug` for the specified types.
macro_rules! impl_display_via_debug {
    ($($t:ty),* $(,)?) => {$(
        impl ::std::fmt::Display for $t {
            #[inline(always)]
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                ::std::fmt::Debug::fmt(self, f)
            }
        }
    )*};
}
pub(crate) use impl_display_via_debug;

/// Persistent integer settings store keyed by section and key name.
///
/// This follows platform configuration file semantics where a value of 0 and
/// an absent key are indistinguishable. Implementations may remove a key
/// outright when 0 is written.
pub trait SettingsStore: Debug + Send + Sync {
    /// Writes `v` for `key` in `section`, returning `false` if the value
    /// could not be stored.
    fn write(&self, section: &str, key: &str, v: u32) -> bool;

    /// Returns the value of `key` in `section`, or 0 if the key is absent or
    /// unreadable.
    fn read(&self, section: &str, key: &str) -> u32;
}
