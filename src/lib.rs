pub mod api;
pub mod archive;
pub mod capture;
pub mod cipher;
pub mod config;
pub mod driver;
pub mod engine;
pub mod events;
pub mod lifecycle;
pub mod prefs;
pub mod protocol;
pub mod registry;
pub mod run;
pub mod session;
pub mod shutdown;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod tree;
