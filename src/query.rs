//! Thin read path over ingested call details.

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::records::CallDetail;

/// Optional caller filter plus an optional result cap.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallDetailFilter {
    pub caller: Option<i64>,
    pub take: Option<usize>,
}

/// Anything that can answer call-detail queries.
pub trait CallDetailQuery: Send + Sync {
    fn query<'a>(
        &'a self,
        filter: &'a CallDetailFilter,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<CallDetail>, PipelineError>> + Send + 'a>>;
}

/// Renders the destination query, e.g.
/// `CallDetails | where caller_id == "441215598896" | take 10`.
pub fn build_query_text(table: &str, filter: &CallDetailFilter) -> String {
    let mut query = table.to_string();
    if let Some(caller) = filter.caller {
        query.push_str(&format!(" | where caller_id == \"{}\"", caller));
    }
    if let Some(take) = filter.take {
        query.push_str(&format!(" | take {}", take));
    }
    query
}

/// Forwards `filter` to `repo`.
pub async fn query_call_details<Q>(
    repo: &Q,
    filter: &CallDetailFilter,
) -> Result<Vec<CallDetail>, PipelineError>
where
    Q: CallDetailQuery + ?Sized,
{
    tracing::debug!(caller = ?filter.caller, take = ?filter.take, "[QUERY] Querying call details");
    let records = repo.query(filter).await?;
    tracing::debug!(returned = records.len(), "[QUERY] Query complete");
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_table_without_filters() {
        assert_eq!(build_query_text("CallDetails", &CallDetailFilter::default()), "CallDetails");
    }

    #[test]
    fn caller_and_take_are_piped_in_order() {
        let filter = CallDetailFilter {
            caller: Some(441215598896),
            take: Some(10),
        };
        assert_eq!(
            build_query_text("CallDetails", &filter),
            "CallDetails | where caller_id == \"441215598896\" | take 10"
        );
    }

    #[test]
    fn take_only() {
        let filter = CallDetailFilter {
            caller: None,
            take: Some(5),
        };
        assert_eq!(build_query_text("T", &filter), "T | take 5");
    }

    struct Fixed(Vec<CallDetail>);

    impl CallDetailQuery for Fixed {
        fn query<'a>(
            &'a self,
            filter: &'a CallDetailFilter,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<CallDetail>, PipelineError>> + Send + 'a>>
        {
            Box::pin(async move {
                Ok(self
                    .0
                    .iter()
                    .take(filter.take.unwrap_or(usize::MAX))
                    .cloned()
                    .collect())
            })
        }
    }

    #[tokio::test]
    async fn forwards_to_repository() {
        let record = CallDetail {
            caller_id: Some(1),
            recipient: Some(2),
            call_end_datetime: None,
            duration: Some(3),
            cost: Some(0.1),
            reference: "r".into(),
            currency: Some("GBP".into()),
        };
        let repo = Fixed(vec![record.clone(), record.clone(), record]);
        let filter = CallDetailFilter {
            caller: None,
            take: Some(2),
        };
        let out = query_call_details(&repo, &filter).await.unwrap();
        assert_eq!(out.len(), 2);
    }
}
