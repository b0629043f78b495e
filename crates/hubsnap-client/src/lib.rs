pub mod browser;
pub mod hubpage;
pub mod llm;
pub mod parse;

pub use browser::{BrowserDriver, BrowserDriverFactory};
pub use hubpage::{DetailPageScraper, DetailSelectors, RepoPageScraper};
pub use llm::OpenAiEnricher;
