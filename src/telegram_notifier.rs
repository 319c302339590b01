use reqwest::Client;
use serde_json::json;
use tracing::{debug, warn};

/// Minimal Telegram Bot API client. Disabled unless both token and chat are set.
#[derive(Clone)]
pub struct TelegramNotifier {
  client: Option<Client>,
  token: Option<String>,
  chat_id: Option<String>,
}

impl TelegramNotifier {
  pub fn new(token: Option<String>, chat_id: Option<String>) -> Self {
    let token = token.filter(|t| !t.is_empty());
    let chat_id = chat_id.filter(|c| !c.is_empty());

    let client = if token.is_some() && chat_id.is_some() {
      Some(Client::new())
    } else {
      None
    };

    Self { client, token, chat_id }
  }

  /// Notifier that never sends anything
  pub fn disabled() -> Self {
    Self::new(None, None)
  }

  pub fn is_enabled(&self) -> bool {
    self.client.is_some()
  }

  /// Send an HTML formatted message. Failures are logged, never returned.
  pub async fn send_notification(&self, message: &str) {
    let (Some(client), Some(token), Some(chat_id)) =
      (&self.client, &self.token, &self.chat_id)
    else {
      return;
    };

    let url = format!("https://api.telegram.org/bot{}/sendMessage", token);
    let payload = json!({
        "chat_id": chat_id,
        "text": message,
        "parse_mode": "HTML",
        "disable_web_page_preview": true
    });

    match client.post(&url).json(&payload).send().await {
      Ok(response) => {
        let status = response.status();
        if status.is_success() {
          debug!("Telegram notification sent");
        } else {
          warn!("Telegram API error: Status {}", status);
          if let Ok(text) = response.text().await {
            warn!("Telegram API response: {}", text);
          }
        }
      }
      Err(e) => {
        warn!("Failed to send Telegram notification: {}", e);
      }
    }
  }
}

impl Default for TelegramNotifier {
  fn default() -> Self {
    Self::disabled()
  }
}
