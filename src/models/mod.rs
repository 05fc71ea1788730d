// Model layer
// Granite decoder with LoRA adapters on candle, plus loading and generation

pub mod adapters;
pub mod common;
pub mod generator;
pub mod granite;
pub mod loader;
pub mod lora;
pub mod memory;

pub use adapters::{GraniteEsgAdapter, LocalModelAdapter};
pub use common::{device_label, get_device, get_dtype};
pub use generator::{CandleGenerator, TextGeneration};
pub use granite::{GraniteConfig, GraniteModel, ParameterSummary};
pub use loader::{AdapterMode, LoadedModel, ModelLoader, ModelSource};
pub use lora::{LoraAdapter, LoraConfig, LoraLinear};
pub use memory::MemoryUsage;
