pub mod converter;
pub mod provider;
pub mod sse;

pub mod mock;

pub use mock::{MockProvider, MockResponse, MockTurn};
pub use provider::{AnthropicProvider, ProviderConfig};
