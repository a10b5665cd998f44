pub mod db;
pub mod io;
pub mod mode;

pub use db::ForemanDb;
pub use io::{normalize_path, resolve_within, RuntimePaths};
pub use mode::{EnterCheck, EnterContext, ListenerHandle, Mode, ModeRegistry, ModeState};
