pub mod email;
pub mod webhook;

pub use email::{EmailChannel, EmailSettings};
pub use webhook::{PayloadShape, WebhookChannel};
