//! GraphQL transaction source.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::{Edge, Page, RemoteSource, TagFilter};
use crate::error::{Error, Result};
use crate::model::Position;

/// [`RemoteSource`] querying a GraphQL gateway's `transactions` connection in
/// ascending block height order.
#[derive(Debug, Clone)]
pub struct GraphqlSource {
    client: reqwest::Client,
    endpoint: String,
    query: String,
}

impl GraphqlSource {
    /// Builds a source for `endpoint`. `with_quantity` also selects the
    /// transferred amount of each transaction.
    pub fn new(endpoint: &str, tags: &[TagFilter], page_size: usize, with_quantity: bool) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.to_string(),
            query: build_query(tags, page_size, with_quantity),
        }
    }

    pub fn query(&self) -> &str {
        &self.query
    }
}

#[derive(Deserialize)]
struct Response {
    data: Option<Data>,
    #[serde(default)]
    errors: Vec<GraphqlError>,
}

#[derive(Deserialize)]
struct GraphqlError {
    message: String,
}

#[derive(Deserialize)]
struct Data {
    transactions: Connection,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Connection {
    page_info: PageInfo,
    #[serde(default)]
    edges: Vec<Edge>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageInfo {
    has_next_page: bool,
}

#[async_trait]
impl RemoteSource for GraphqlSource {
    async fn fetch_page(&self, after: &Position) -> Result<Page> {
        let cursor = (!after.is_initial()).then(|| after.as_str());
        let body = json!({
            "query": self.query,
            "variables": { "cursor": cursor },
        });
        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Source(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Source(format!(
                "{} returned status {}",
                self.endpoint, status
            )));
        }
        let response: Response = response
            .json()
            .await
            .map_err(|e| Error::Source(format!("invalid response: {}", e)))?;
        let page = into_page(response)?;
        debug!(
            edges = page.edges.len(),
            has_next_page = page.has_next_page,
            "fetched page"
        );
        Ok(page)
    }
}

fn into_page(response: Response) -> Result<Page> {
    if let Some(error) = response.errors.first() {
        return Err(Error::Source(error.message.clone()));
    }
    let data = response
        .data
        .ok_or_else(|| Error::Source("response has no data".to_string()))?;
    Ok(Page {
        has_next_page: data.transactions.page_info.has_next_page,
        edges: data.transactions.edges,
    })
}

fn build_query(tags: &[TagFilter], page_size: usize, with_quantity: bool) -> String {
    let mut filters = Vec::with_capacity(tags.len());
    for tag in tags {
        let values: Vec<String> = tag.values.iter().map(|v| json!(v).to_string()).collect();
        filters.push(format!(
            "{{ name: {}, values: [{}] }}",
            json!(tag.name),
            values.join(", ")
        ));
    }
    let quantity = if with_quantity {
        "\n        quantity { winston ar }"
    } else {
        ""
    };
    format!(
        r#"query($cursor: String) {{
  transactions(
    tags: [{}]
    after: $cursor
    first: {}
    sort: HEIGHT_ASC
  ) {{
    pageInfo {{ hasNextPage }}
    edges {{
      cursor
      node {{
        id
        owner {{ address }}
        tags {{ name value }}
        block {{ height timestamp }}{}
      }}
    }}
  }}
}}"#,
        filters.join(", "),
        page_size,
        quantity
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_build_query_with_tag_filters() {
        // given
        let tags = vec![
            TagFilter {
                name: "App-Name".to_string(),
                values: vec!["ArConnect".to_string()],
            },
            TagFilter {
                name: "Type".to_string(),
                values: vec!["Print-Archive".to_string()],
            },
        ];

        // when
        let query = build_query(&tags, 100, false);

        // then
        assert!(query.contains(
            r#"tags: [{ name: "App-Name", values: ["ArConnect"] }, { name: "Type", values: ["Print-Archive"] }]"#
        ));
        assert!(query.contains("first: 100"));
        assert!(query.contains("sort: HEIGHT_ASC"));
        assert!(!query.contains("quantity"));
    }

    #[test]
    fn should_select_quantity_when_requested() {
        let query = build_query(&[], 50, true);
        assert!(query.contains("quantity { winston ar }"));
    }

    #[test]
    fn should_decode_page() {
        // given
        let body = r#"{
          "data": {
            "transactions": {
              "pageInfo": { "hasNextPage": true },
              "edges": [
                {
                  "cursor": "c1",
                  "node": {
                    "id": "tx1",
                    "owner": { "address": "addr1" },
                    "tags": [{ "name": "Client", "value": "ArConnect" }],
                    "block": { "height": 10, "timestamp": 1700000000 },
                    "quantity": { "winston": "1000", "ar": "0.000000001" }
                  }
                },
                {
                  "cursor": "c2",
                  "node": {
                    "id": "tx2",
                    "owner": { "address": "addr2" },
                    "tags": [],
                    "block": null
                  }
                }
              ]
            }
          }
        }"#;

        // when
        let page = into_page(serde_json::from_str(body).unwrap()).unwrap();

        // then
        assert!(page.has_next_page);
        assert_eq!(page.edges.len(), 2);
        assert_eq!(page.edges[0].node.block.as_ref().unwrap().height, 10);
        assert!(page.edges[1].node.block.is_none());
        assert_eq!(page.last_cursor(), Some(Position::from("c2")));
    }

    #[test]
    fn should_surface_graphql_errors() {
        // given
        let body = r#"{ "errors": [{ "message": "rate limited" }] }"#;

        // when
        let result = into_page(serde_json::from_str(body).unwrap());

        // then
        assert!(matches!(result, Err(Error::Source(msg)) if msg == "rate limited"));
    }
}
