//! ClickHouse sink over the HTTP interface.

use async_trait::async_trait;
use reqwest::StatusCode;

use super::config::ClickHouseConfig;
use super::{QueryRow, Sink, SinkError, SinkResult};

/// [`Sink`] backed by ClickHouse's HTTP interface.
///
/// Statements are sent as the POST body to `/?database=<db>`. Queries are
/// issued with `FORMAT JSONEachRow` and decoded line by line.
#[derive(Debug, Clone)]
pub struct ClickHouseSink {
    client: reqwest::Client,
    config: ClickHouseConfig,
}

impl ClickHouseSink {
    pub fn new(config: ClickHouseConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/", self.config.url.trim_end_matches('/'))
    }

    fn request(&self, body: String) -> reqwest::RequestBuilder {
        let mut request = self
            .client
            .post(self.endpoint())
            .query(&[("database", self.config.database.as_str())])
            .body(body);
        if let Some(user) = &self.config.user {
            request = request.header("X-ClickHouse-User", user);
        }
        if let Some(password) = &self.config.password {
            request = request.header("X-ClickHouse-Key", password);
        }
        request
    }

    async fn send(&self, body: String) -> SinkResult<String> {
        let response = self
            .request(body)
            .send()
            .await
            .map_err(|e| SinkError::Connection(e.to_string()))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| SinkError::Connection(e.to_string()))?;
        if !status.is_success() {
            return Err(SinkError::Rejected {
                status: status.as_u16(),
                message: text.trim().to_string(),
            });
        }
        Ok(text)
    }
}

#[async_trait]
impl Sink for ClickHouseSink {
    async fn exec(&self, query: &str) -> SinkResult<()> {
        self.send(query.to_string()).await.map(|_| ())
    }

    async fn query(&self, query: &str) -> SinkResult<Vec<QueryRow>> {
        let body = with_json_each_row(query);
        let text = self.send(body).await?;
        parse_json_each_row(&text)
    }

    async fn ping(&self) -> SinkResult<()> {
        let url = format!("{}ping", self.endpoint());
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| SinkError::Connection(e.to_string()))?;
        match response.status() {
            StatusCode::OK => Ok(()),
            status => Err(SinkError::Connection(format!(
                "ping returned status {}",
                status
            ))),
        }
    }
}

/// Appends `FORMAT JSONEachRow` unless the query already names a format.
fn with_json_each_row(query: &str) -> String {
    let trimmed = query.trim().trim_end_matches(';');
    if trimmed.to_ascii_uppercase().contains(" FORMAT ") {
        trimmed.to_string()
    } else {
        format!("{} FORMAT JSONEachRow", trimmed)
    }
}

fn parse_json_each_row(text: &str) -> SinkResult<Vec<QueryRow>> {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            serde_json::from_str::<QueryRow>(line).map_err(|e| SinkError::Decode(e.to_string()))
        })
        .collect()
}
