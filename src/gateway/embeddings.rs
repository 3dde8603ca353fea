//! Embeddings and rerank endpoints.
//!
//! Both run on the embeddings backend configured in Settings. Rerank is
//! cosine similarity of the query embedding against each document embedding,
//! computed gateway-side — no dedicated rerank model is involved.

use std::sync::Arc;

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::{
    context::GatewayContext,
    error::GatewayError,
    registry::Capability,
    upstream::embed,
};

fn input_texts(input: Option<&Value>) -> Result<Vec<String>, GatewayError> {
    match input {
        Some(Value::String(s)) => Ok(vec![s.clone()]),
        Some(Value::Array(items)) if items.iter().all(Value::is_string) => {
            Ok(items.iter().filter_map(Value::as_str).map(String::from).collect())
        }
        _ => Err(GatewayError::InvalidRequest(
            "input must be a string or list of strings".into(),
        )),
    }
}

fn effective_model<'a>(ctx: &'a GatewayContext, requested: Option<&'a str>) -> &'a str {
    match requested.map(str::trim) {
        Some("") | Some("default") | None => &ctx.settings.embeddings_model,
        Some(model) => model,
    }
}

/// `POST /v1/embeddings`.
pub async fn embeddings(
    State(ctx): State<Arc<GatewayContext>>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, GatewayError> {
    let texts = input_texts(body.get("input"))?;
    let model = effective_model(&ctx, body.get("model").and_then(Value::as_str)).to_string();

    let backend = ctx.settings.embeddings_backend;
    let backend_class = ctx.registry.resolve_class(backend.as_str()).to_string();
    let lease = ctx.admit(&backend_class, Capability::Embeddings)?;

    let rows = embed(backend, &ctx.settings, &texts, &model).await?;
    drop(lease);

    let data: Vec<Value> = rows
        .iter()
        .enumerate()
        .map(|(index, embedding)| json!({ "object": "embedding", "index": index, "embedding": embedding }))
        .collect();
    Ok(Json(json!({ "object": "list", "data": data, "model": model })))
}

/// `POST /v1/rerank`.
pub async fn rerank(
    State(ctx): State<Arc<GatewayContext>>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, GatewayError> {
    let query = body
        .get("query")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .ok_or_else(|| GatewayError::InvalidRequest("query must be non-empty".into()))?
        .to_string();

    let documents: Vec<String> = match body.get("documents").and_then(Value::as_array) {
        Some(docs) if !docs.is_empty() => {
            let mut out = Vec::with_capacity(docs.len());
            for doc in docs {
                match doc.as_str().filter(|d| !d.is_empty()) {
                    Some(d) => out.push(d.to_string()),
                    None => {
                        return Err(GatewayError::InvalidRequest(
                            "documents must be a list of non-empty strings".into(),
                        ))
                    }
                }
            }
            out
        }
        _ => return Err(GatewayError::InvalidRequest("documents must be non-empty".into())),
    };

    let top_n = body
        .get("top_n")
        .and_then(Value::as_u64)
        .filter(|&n| n > 0)
        .map(|n| n as usize)
        .unwrap_or(documents.len())
        .min(documents.len());

    let model = effective_model(&ctx, body.get("model").and_then(Value::as_str)).to_string();
    let backend = ctx.settings.embeddings_backend;
    let backend_class = ctx.registry.resolve_class(backend.as_str()).to_string();
    let lease = ctx.admit(&backend_class, Capability::Embeddings)?;

    let query_embedding = embed(backend, &ctx.settings, &[query], &model).await?;
    let doc_embeddings = embed(backend, &ctx.settings, &documents, &model).await?;
    drop(lease);

    let query_embedding = query_embedding
        .first()
        .ok_or_else(|| anyhow::anyhow!("empty query embedding"))?;

    let mut scored: Vec<(f64, usize)> = doc_embeddings
        .iter()
        .enumerate()
        .map(|(i, emb)| (cosine(query_embedding, emb), i))
        .collect();
    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

    let data: Vec<Value> = scored
        .into_iter()
        .take(top_n)
        .map(|(score, index)| {
            json!({ "index": index, "relevance_score": score, "document": documents[index] })
        })
        .collect();
    Ok(Json(json!({ "object": "list", "data": data, "model": model })))
}

/// Cosine similarity; zero vectors score 0.
fn cosine(a: &[f64], b: &[f64]) -> f64 {
    let dot: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f64 = a.iter().map(|x| x * x).sum::<f64>().sqrt();
    let norm_b: f64 = b.iter().map(|x| x * x).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}
