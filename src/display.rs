use async_trait::async_trait;

pub type Callback = Box<dyn Fn() + Send + Sync>;

/// Interaction hooks a display may wire to its controls.
#[derive(Default)]
pub struct DisplayCallbacks {
    pub press: Option<Callback>,
    pub release: Option<Callback>,
    pub mode: Option<Callback>,
    pub auto: Option<Callback>,
    pub abort: Option<Callback>,
    pub send_text: Option<Box<dyn Fn(String) + Send + Sync>>,
}

/// Status surface of the device. Implementations never fail.
#[async_trait]
pub trait Display: Send + Sync {
    async fn set_callbacks(&self, callbacks: DisplayCallbacks);
    async fn update_button_status(&self, text: &str);
    async fn update_status(&self, status: &str, connected: bool);
    async fn update_text(&self, text: &str);
    async fn update_emotion(&self, emotion: &str);
    async fn start(&self);
}

/// Headless display: every update becomes a log line.
#[derive(Debug, Default)]
pub struct ServiceDisplay;

impl ServiceDisplay {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Display for ServiceDisplay {
    // 无界面模式，没有可交互的控件
    async fn set_callbacks(&self, _callbacks: DisplayCallbacks) {}

    async fn update_button_status(&self, text: &str) {
        log::info!("[Button] {}", text);
    }

    async fn update_status(&self, status: &str, connected: bool) {
        let conn = if connected { "Connected" } else { "Disconnected" };
        log::info!("[Status] {} ({})", status, conn);
    }

    async fn update_text(&self, text: &str) {
        let text = text.trim();
        if !text.is_empty() {
            log::info!("[Text] {}", text);
        }
    }

    async fn update_emotion(&self, emotion: &str) {
        log::info!("[Emotion] {}", emotion);
    }

    async fn start(&self) {
        log::info!("Service Display Started - Running in headless mode");
    }
}
