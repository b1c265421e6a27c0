/// Built-in chat provider defaults, listed in fallback priority order.
pub struct ProviderSeed {
    pub id: &'static str,
    pub display: &'static str,
    pub base_url: &'static str,
    pub model: &'static str,
    pub key_env: &'static str,
}

pub const PROVIDER_SEEDS: &[ProviderSeed] = &[
    ProviderSeed {
        id: "deepseek",
        display: "DeepSeek",
        base_url: "https://api.deepseek.com",
        model: "deepseek-chat",
        key_env: "DEEPSEEK_API_KEY",
    },
    ProviderSeed {
        id: "groq",
        display: "Groq",
        base_url: "https://api.groq.com/openai/v1",
        model: "llama-3.3-70b-versatile",
        key_env: "GROQ_API_KEY",
    },
    ProviderSeed {
        id: "openai",
        display: "OpenAI",
        base_url: "https://api.openai.com/v1",
        model: "gpt-4",
        key_env: "OPENAI_API_KEY",
    },
];
