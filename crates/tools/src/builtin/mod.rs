mod clock;
mod shell;
mod web;

pub use clock::ClockNow;
pub use shell::ShellExec;
pub use web::WebFetch;
