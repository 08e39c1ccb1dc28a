use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use crate::config::{DocumentOutputConfig, JobConfig};
use crate::error::StepError;
use crate::key::StepKey;
use crate::services::{DocumentRequest, DocumentWriter, require};
use crate::step::{Step, StepContext, StepResult, object};
use crate::steps::{required_output, str_field};

/// Writes the upstream summary (or raw content) into a new document.
pub struct DocumentOutputStep {
    writer: Option<Arc<dyn DocumentWriter>>,
}

impl DocumentOutputStep {
    pub fn new(writer: Option<Arc<dyn DocumentWriter>>) -> Self {
        Self { writer }
    }

    fn credential_id<'a>(config: &'a DocumentOutputConfig, job_config: &'a JobConfig) -> Option<&'a str> {
        config
            .credential_id
            .as_deref()
            .or(job_config.credential_id.as_deref())
            .filter(|c| !c.trim().is_empty())
    }
}

#[async_trait]
impl Step for DocumentOutputStep {
    type Config = DocumentOutputConfig;

    const KEY: StepKey = StepKey::DocumentOutput;

    async fn run(&self, ctx: &StepContext<'_>, config: &Self::Config) -> Result<StepResult, StepError> {
        let input = match required_output(ctx.output_of(&config.input_step_id), &config.input_step_id) {
            Ok(input) => input,
            Err(msg) => return Ok(StepResult::failure(msg)),
        };

        let content = match str_field(input, "summary") {
            "" => str_field(input, "content"),
            summary => summary,
        };
        if content.is_empty() {
            return Ok(StepResult::skipped_with(
                "No content available for document output.",
                object(json!({"created": false, "reason": "empty_content"})),
            ));
        }

        let writer = match require(&self.writer, "Document writer") {
            Ok(w) => w,
            Err(msg) => return Ok(StepResult::failure(msg)),
        };
        let Some(credential_id) = Self::credential_id(config, ctx.job_config) else {
            return Ok(StepResult::failure("Missing document credential_id."));
        };
        if let Err(e) = writer.check_credential(credential_id).await {
            return Ok(StepResult::failure(e.to_string()));
        }

        let title = config
            .title
            .clone()
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| format!("Job Output {}", ctx.now.format("%Y-%m-%d")));

        let request = DocumentRequest {
            credential_id: credential_id.to_string(),
            title: title.clone(),
            content: content.to_string(),
            folder_id: config.folder_id.clone(),
            share_with: config.share_with.clone(),
        };
        let created = match writer.create_document(&request).await {
            Ok(doc) => doc,
            Err(e) => return Ok(StepResult::failure(format!("Document output failed: {e}"))),
        };

        Ok(StepResult::success(object(json!({
            "created": true,
            "doc_id": created.doc_id,
            "doc_url": created.doc_url,
            "title": title,
        }))))
    }

    fn preflight(&self, step_id: &str, config: &Self::Config, job_config: &JobConfig) -> Vec<String> {
        let mut errors = Vec::new();
        if self.writer.is_none() {
            errors.push(format!("{step_id}: document writer is not configured."));
        }
        if Self::credential_id(config, job_config).is_none() {
            errors.push(format!("{step_id}: missing credential_id in step or job config."));
        }
        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ServiceError;
    use crate::services::CreatedDocument;
    use crate::steps::testing::Fixture;
    use forgejobs_core::StepStatus;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeWriter {
        requests: Mutex<Vec<DocumentRequest>>,
    }

    #[async_trait]
    impl DocumentWriter for FakeWriter {
        async fn check_credential(&self, credential_id: &str) -> Result<(), ServiceError> {
            if credential_id == "missing" {
                return Err(ServiceError::new("Credential missing was not found."));
            }
            Ok(())
        }

        async fn create_document(&self, request: &DocumentRequest) -> Result<CreatedDocument, ServiceError> {
            self.requests.lock().unwrap().push(request.clone());
            Ok(CreatedDocument {
                doc_id: "doc-1".into(),
                doc_url: Some("https://docs.example.com/doc-1".into()),
            })
        }
    }

    fn config(credential: Option<&str>) -> DocumentOutputConfig {
        DocumentOutputConfig {
            input_step_id: "summarize_content".into(),
            credential_id: credential.map(str::to_string),
            title: None,
            folder_id: None,
            share_with: vec!["ops@example.com".into()],
            max_attempts: 2,
        }
    }

    #[tokio::test]
    async fn creates_document_with_dated_title() {
        let writer = Arc::new(FakeWriter::default());
        let step = DocumentOutputStep::new(Some(writer.clone()));
        let fx = Fixture::new().with_output("summarize_content", json!({"summary": "  brief  "}));
        let result = step.run(&fx.ctx(), &config(Some("cred-1"))).await.unwrap();

        let output = result.output().unwrap();
        assert_eq!(output["doc_url"], json!("https://docs.example.com/doc-1"));
        assert_eq!(output["title"], json!("Job Output 2024-06-03"));
        let requests = writer.requests.lock().unwrap();
        assert_eq!(requests[0].content, "brief");
        assert_eq!(requests[0].share_with, vec!["ops@example.com".to_string()]);
    }

    #[tokio::test]
    async fn empty_content_skips_and_bad_credential_fails() {
        let step = DocumentOutputStep::new(Some(Arc::new(FakeWriter::default())));
        let empty = Fixture::new().with_output("summarize_content", json!({"summary": ""}));
        let result = step.run(&empty.ctx(), &config(Some("cred-1"))).await.unwrap();
        assert_eq!(result.status(), StepStatus::Skipped);

        let fx = Fixture::new().with_output("summarize_content", json!({"content": "raw"}));
        let result = step.run(&fx.ctx(), &config(Some("missing"))).await.unwrap();
        assert_eq!(result, StepResult::failure("Credential missing was not found."));

        let result = step.run(&fx.ctx(), &config(None)).await.unwrap();
        assert_eq!(result, StepResult::failure("Missing document credential_id."));
    }
}
