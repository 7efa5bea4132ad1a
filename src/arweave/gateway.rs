use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

const ARWEAVE_GATEWAY: &str = "https://arweave.net";

const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

// The gateway caps GraphQL pages at 100 edges.
const PAGE_SIZE: u32 = 100;

const TRANSACTIONS_QUERY: &str = "
    query($min: Int!, $max: Int!, $first: Int!, $after: String) {
        transactions(block: { min: $min, max: $max }, sort: HEIGHT_ASC, first: $first, after: $after) {
            pageInfo { hasNextPage }
            edges {
                cursor
                node {
                    fee { winston }
                    block { height timestamp }
                }
            }
        }
    }
";

#[derive(Debug, Deserialize)]
struct NetworkInfo {
    height: u64,
}

#[derive(Debug, Deserialize)]
struct GraphQlResponse {
    data: Option<TransactionsData>,
}

#[derive(Debug, Deserialize)]
struct TransactionsData {
    transactions: TransactionsConnection,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransactionsConnection {
    page_info: PageInfo,
    edges: Vec<TransactionEdge>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageInfo {
    has_next_page: bool,
}

#[derive(Debug, Deserialize)]
pub struct TransactionEdge {
    pub cursor: String,
    pub node: TransactionNode,
}

#[derive(Debug, Deserialize)]
pub struct TransactionNode {
    pub fee: TransactionFee,
    pub block: TransactionBlock,
}

#[derive(Debug, Deserialize)]
pub struct TransactionFee {
    pub winston: String,
}

#[derive(Debug, Deserialize)]
pub struct TransactionBlock {
    #[allow(unused)]
    pub height: u64,
    pub timestamp: i64,
}

pub struct TransactionsPage {
    pub has_next_page: bool,
    pub edges: Vec<TransactionEdge>,
}

pub struct ArweaveGateway {
    client: reqwest::Client,
    base_url: String,
}

impl ArweaveGateway {
    pub fn new() -> Self {
        Self::new_with_url(ARWEAVE_GATEWAY.to_string())
    }

    pub fn new_with_url(base_url: String) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .expect("expect reqwest client to build"),
            base_url,
        }
    }

    pub async fn current_height(&self) -> Result<u64> {
        let url = format!("{}/info", self.base_url);

        debug!("sending request to {}", url);

        let info = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json::<NetworkInfo>()
            .await?;

        Ok(info.height)
    }

    /// One page of fee-bearing transactions for a block range, oldest block
    /// first.
    pub async fn fee_transactions(
        &self,
        min_block: u64,
        max_block: u64,
        after: Option<&str>,
    ) -> Result<TransactionsPage> {
        let url = format!("{}/graphql", self.base_url);

        debug!("sending request to {}", url);

        let body = json!({
            "query": TRANSACTIONS_QUERY,
            "variables": {
                "min": min_block,
                "max": max_block,
                "first": PAGE_SIZE,
                "after": after,
            },
        });

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json::<GraphQlResponse>()
            .await?;

        let connection = response
            .data
            .context("expect transactions data in gateway response")?
            .transactions;

        Ok(TransactionsPage {
            has_next_page: connection.page_info.has_next_page,
            edges: connection.edges,
        })
    }
}

impl Default for ArweaveGateway {
    fn default() -> Self {
        Self::new()
    }
}
