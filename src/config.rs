/// Environment variable that overrides `api_key` at runtime.
pub const API_KEY_ENV: &str = "GEMINI_API_KEY";

#[derive(Debug, Clone)]
pub struct Config {
    pub app_name: &'static str,
    pub app_version: &'static str,

    // 音频设备配置
    pub capture_device: &'static str,
    pub playback_device: &'static str,
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    pub frame_size: usize,
    pub playback_period_size: usize,

    // 网络配置
    pub ws_url: &'static str,
    pub api_key: String,
    pub connect_timeout_ms: u64,
    pub close_timeout_ms: u64,

    // 会话参数
    pub model: &'static str,
    pub voice: &'static str,
    pub language: &'static str,
}

impl Config {
    /// 从编译时设置的环境变量创建配置
    /// 所有参数都在编译时从 config.toml 中读取
    pub fn new() -> Result<Self, &'static str> {
        Ok(Self {
            app_name: env!("APP_NAME"),
            app_version: env!("APP_VERSION"),

            capture_device: env!("CAPTURE_DEVICE"),
            playback_device: env!("PLAYBACK_DEVICE"),
            input_sample_rate: env!("INPUT_SAMPLE_RATE").parse()
                .map_err(|_| "Failed to parse INPUT_SAMPLE_RATE")?,
            output_sample_rate: env!("OUTPUT_SAMPLE_RATE").parse()
                .map_err(|_| "Failed to parse OUTPUT_SAMPLE_RATE")?,
            frame_size: env!("FRAME_SIZE").parse()
                .map_err(|_| "Failed to parse FRAME_SIZE")?,
            playback_period_size: env!("PLAYBACK_PERIOD_SIZE").parse()
                .map_err(|_| "Failed to parse PLAYBACK_PERIOD_SIZE")?,

            ws_url: env!("WS_URL"),
            api_key: env!("API_KEY").to_string(),
            connect_timeout_ms: env!("CONNECT_TIMEOUT_MS").parse()
                .map_err(|_| "Failed to parse CONNECT_TIMEOUT_MS")?,
            close_timeout_ms: env!("CLOSE_TIMEOUT_MS").parse()
                .map_err(|_| "Failed to parse CLOSE_TIMEOUT_MS")?,

            model: env!("SESSION_MODEL"),
            voice: env!("SESSION_VOICE"),
            language: env!("SESSION_LANGUAGE"),
        })
    }

    /// Apply runtime overrides from the process environment.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(key) = std::env::var(API_KEY_ENV) {
            let key = key.trim();
            if !key.is_empty() {
                self.api_key = key.to_string();
            }
        }
        self
    }

    /// System prompt for the agent, phrased for the configured language.
    pub fn system_instruction(&self) -> String {
        format!(
            "You are a warm, patient, and helpful assistant for villagers in a rural community. \
             Speak simply, slowly, and clearly in {}. Your goal is to help them understand digital \
             tools, government schemes, and basic healthcare. Avoid complex jargon.",
            self.language
        )
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new().expect("Failed to create default Config from build-time environment variables")
    }
}
