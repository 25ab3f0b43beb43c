pub mod run;
pub mod validate;

pub use run::{RunArgs, handle_run};
pub use validate::{ValidateArgs, handle_validate};
