use std::collections::HashMap;
use std::sync::Arc;

use crate::anthropic::AnthropicChannel;
use crate::gemini::GeminiChannel;
use crate::openai::OpenAiChannel;
use crate::types::Channel;

/// Flat map of `channel_type` to strategy, bound at group load time.
pub struct ChannelRegistry {
    channels: HashMap<&'static str, Arc<dyn Channel>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self {
            channels: HashMap::new(),
        }
    }

    pub fn register(&mut self, channel: Arc<dyn Channel>) {
        self.channels.insert(channel.channel_type(), channel);
    }

    pub fn get(&self, channel_type: &str) -> Option<Arc<dyn Channel>> {
        self.channels.get(channel_type).cloned()
    }

    /// The built-in families.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(OpenAiChannel));
        registry.register(Arc::new(GeminiChannel));
        registry.register(Arc::new(AnthropicChannel));
        registry
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}
