//! Storage façade — S3 bucket listing and IAM policy lookup.
//!
//! Wraps `aws-sdk-s3` and `aws-sdk-iam` clients behind the two operations
//! the tool layer needs: `list_buckets` and `get_policies_for_bucket`.
//! Every call is a fresh remote round trip; nothing is cached and no retry
//! policy is layered on top of the SDK defaults.

use aws_sdk_s3::operation::head_bucket::HeadBucketError;
use aws_smithy_runtime_api::client::orchestrator::HttpResponse;
use aws_smithy_runtime_api::client::result::SdkError;
use aws_smithy_types::error::metadata::ProvideErrorMetadata;
use percent_encoding::percent_decode_str;
use serde_json::{Map, Value, json};

use crate::config::StorageConfig;
use crate::error::{ButlerError, Result};

/// Service error codes that mean the credentials were rejected.
const AUTH_CODES: &[&str] = &[
    "AccessDenied",
    "AccessDeniedException",
    "InvalidAccessKeyId",
    "SignatureDoesNotMatch",
];

/// Client façade over the S3 and IAM endpoints.
///
/// Safe for concurrent use: the SDK clients are cheaply cloneable handles
/// over a shared connection pool.
#[derive(Clone)]
pub struct StorageClient {
    s3: aws_sdk_s3::Client,
    iam: aws_sdk_iam::Client,
}

impl StorageClient {
    /// Build S3 and IAM clients from static credentials and custom endpoints.
    pub fn new(config: &StorageConfig) -> Self {
        let credentials = aws_sdk_s3::config::Credentials::new(
            config.access_key.clone(),
            config.secret_key.clone(),
            None,
            None,
            "s3-butler",
        );

        let s3_config = aws_sdk_s3::config::Builder::new()
            .behavior_version(aws_sdk_s3::config::BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new("us-east-1"))
            .endpoint_url(&config.s3_endpoint)
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();

        let iam_credentials = aws_sdk_iam::config::Credentials::new(
            config.access_key.clone(),
            config.secret_key.clone(),
            None,
            None,
            "s3-butler",
        );
        let iam_config = aws_sdk_iam::config::Builder::new()
            .behavior_version(aws_sdk_iam::config::BehaviorVersion::latest())
            .region(aws_sdk_iam::config::Region::new("us-east-1"))
            .endpoint_url(&config.iam_endpoint)
            .credentials_provider(iam_credentials)
            .build();

        Self {
            s3: aws_sdk_s3::Client::from_conf(s3_config),
            iam: aws_sdk_iam::Client::from_conf(iam_config),
        }
    }

    /// List all buckets visible to the configured credentials, in service order.
    pub async fn list_buckets(&self) -> Result<Vec<String>> {
        let output = self
            .s3
            .list_buckets()
            .send()
            .await
            .map_err(|e| map_sdk_error("storage", e))?;

        let buckets: Vec<String> = output
            .buckets()
            .iter()
            .filter_map(|b| b.name().map(str::to_string))
            .collect();

        tracing::info!(count = buckets.len(), "listed buckets");
        Ok(buckets)
    }

    /// Collect every IAM user's policies that reference the given bucket.
    ///
    /// Returns a JSON object mapping each user name to the list of their
    /// policies (`{PolicyName, PolicyDocument}`) with at least one statement
    /// whose resource names the bucket (or the `*` wildcard). The bucket's
    /// existence is checked first so a missing bucket surfaces as `NotFound`
    /// rather than an empty scan.
    pub async fn get_policies_for_bucket(&self, bucket: &str) -> Result<Value> {
        if let Err(err) = self.s3.head_bucket().bucket(bucket).send().await {
            return Err(map_head_bucket_error(bucket, err));
        }

        let mut policies = Map::new();
        for user in self.list_iam_users().await? {
            let matching = self.user_policies_for_bucket(&user, bucket).await?;
            policies.insert(user, Value::Array(matching));
        }

        tracing::info!(bucket = %bucket, users = policies.len(), "scanned IAM users for bucket policies");
        Ok(Value::Object(policies))
    }

    /// All IAM user names for the account, across pagination.
    async fn list_iam_users(&self) -> Result<Vec<String>> {
        let mut users = Vec::new();
        let mut pages = self.iam.list_users().into_paginator().send();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| map_sdk_error("identity", e))?;
            for user in page.users() {
                users.push(user.user_name().to_string());
            }
        }
        Ok(users)
    }

    /// One user's inline and attached policies filtered down to the bucket.
    async fn user_policies_for_bucket(&self, user: &str, bucket: &str) -> Result<Vec<Value>> {
        let inline = self
            .iam
            .list_user_policies()
            .user_name(user)
            .send()
            .await
            .map_err(|e| map_sdk_error("identity", e))?;

        let attached = self
            .iam
            .list_attached_user_policies()
            .user_name(user)
            .send()
            .await
            .map_err(|e| map_sdk_error("identity", e))?;

        let mut names: Vec<String> = inline.policy_names().to_vec();
        names.extend(
            attached
                .attached_policies()
                .iter()
                .filter_map(|p| p.policy_name().map(str::to_string)),
        );

        let mut matching = Vec::new();
        for name in names {
            let fetched = self
                .iam
                .get_user_policy()
                .user_name(user)
                .policy_name(&name)
                .send()
                .await;
            let output = match fetched {
                Ok(output) => output,
                // Attached policies are not always retrievable by user+name;
                // skip them rather than failing the whole scan.
                Err(e) if e.code() == Some("NoSuchEntity") => continue,
                Err(e) => return Err(map_sdk_error("identity", e)),
            };

            let document = decode_policy_document(output.policy_document());
            if document_references_bucket(&document, bucket) {
                matching.push(json!({
                    "PolicyName": name,
                    "PolicyDocument": document,
                }));
            }
        }
        Ok(matching)
    }
}

/// A failed `HeadBucket` is the one place a missing bucket is detectable:
/// 404 (or the SDK's typed `NotFound`) becomes `NotFound`, everything else
/// goes through the shared taxonomy mapping.
fn map_head_bucket_error(bucket: &str, err: SdkError<HeadBucketError, HttpResponse>) -> ButlerError {
    match &err {
        SdkError::ServiceError(ctx)
            if ctx.err().is_not_found() || ctx.raw().status().as_u16() == 404 =>
        {
            ButlerError::NotFound(bucket.to_string())
        }
        _ => map_sdk_error("storage", err),
    }
}

/// Map an SDK error onto the façade error taxonomy.
///
/// Transport-level failures (dispatch, timeout, malformed response) become
/// `Upstream`; rejected-credential service codes become `Auth`; everything
/// else keeps the service's message under `Upstream`.
fn map_sdk_error<E>(backend: &str, err: SdkError<E, HttpResponse>) -> ButlerError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    match &err {
        SdkError::ServiceError(ctx) => {
            let code = ctx.err().code().unwrap_or("");
            let message = ctx
                .err()
                .message()
                .map(str::to_string)
                .unwrap_or_else(|| format!("{:?}", ctx.err()));
            if AUTH_CODES.contains(&code) || ctx.raw().status().as_u16() == 403 {
                ButlerError::Auth(format!("{}: {}", backend, message))
            } else {
                ButlerError::Upstream {
                    backend: backend.to_string(),
                    message: format!("{}: {}", code, message),
                }
            }
        }
        _ => ButlerError::Upstream {
            backend: backend.to_string(),
            message: err.to_string(),
        },
    }
}

/// Decode a policy document that may be URL-encoded (AWS) or plain JSON
/// (S3-compatible implementations). Falls back to the raw string if neither
/// parse succeeds — the document is opaque to this layer.
fn decode_policy_document(raw: &str) -> Value {
    if let Ok(value) = serde_json::from_str(raw) {
        return value;
    }
    if let Ok(decoded) = percent_decode_str(raw).decode_utf8() {
        if let Ok(value) = serde_json::from_str(&decoded) {
            return value;
        }
    }
    Value::String(raw.to_string())
}

/// Whether any statement in the policy document references the bucket.
fn document_references_bucket(document: &Value, bucket: &str) -> bool {
    let Some(statements) = document.get("Statement") else {
        return false;
    };
    let statements = match statements {
        Value::Array(list) => list.as_slice(),
        single => std::slice::from_ref(single),
    };
    statements
        .iter()
        .any(|s| statement_references_bucket(s, bucket))
}

fn statement_references_bucket(statement: &Value, bucket: &str) -> bool {
    let resources = match statement.get("Resource") {
        Some(Value::String(s)) => vec![s.as_str()],
        Some(Value::Array(list)) => list.iter().filter_map(Value::as_str).collect(),
        _ => return false, // no Resource — never a match
    };
    resources.iter().any(|r| resource_names_bucket(r, bucket))
}

/// Parse the 6th colon-separated ARN segment and match `bucket/<name>`
/// against the target bucket name or the `*` wildcard.
fn resource_names_bucket(resource: &str, bucket: &str) -> bool {
    let Some(segment) = resource.splitn(6, ':').nth(5) else {
        return false;
    };
    match segment.strip_prefix("bucket/") {
        Some(name) => name == bucket || name == "*",
        None => false,
    }
}
