//! Convenience wrappers over the `Stores*` capabilities.

use crate::error::{WorkerError, WorkerResult};
use crate::wire::*;
use super::client::WorkerClient;
use super::context::CallContext;

/// Stores parallel key and value columns.
pub async fn set_cols(
    client: &dyn WorkerClient,
    ctx: &CallContext,
    keys: Vec<Vec<f32>>,
    values: Vec<Vec<u8>>,
) -> WorkerResult<()> {
    let opts = StoresSetOptions {
        keys: keys.into_iter().map(StoresKey::from).collect(),
        values: values.into_iter().map(StoresValue::from).collect(),
    };
    ensure_success(client.stores_set(ctx, opts).await?, "set")
}

pub async fn set_single(
    client: &dyn WorkerClient,
    ctx: &CallContext,
    key: Vec<f32>,
    value: Vec<u8>,
) -> WorkerResult<()> {
    set_cols(client, ctx, vec![key], vec![value]).await
}

pub async fn delete_cols(client: &dyn WorkerClient, ctx: &CallContext, keys: Vec<Vec<f32>>) -> WorkerResult<()> {
    let opts = StoresDeleteOptions {
        keys: keys.into_iter().map(StoresKey::from).collect(),
    };
    ensure_success(client.stores_delete(ctx, opts).await?, "delete")
}

pub async fn get_cols(
    client: &dyn WorkerClient,
    ctx: &CallContext,
    keys: Vec<Vec<f32>>,
) -> WorkerResult<(Vec<Vec<f32>>, Vec<Vec<u8>>)> {
    let opts = StoresGetOptions {
        keys: keys.into_iter().map(StoresKey::from).collect(),
    };
    let res = client.stores_get(ctx, opts).await?;
    Ok((
        res.keys.into_iter().map(|k| k.floats).collect(),
        res.values.into_iter().map(|v| v.bytes).collect(),
    ))
}

/// Nearest neighbours as `(keys, values, similarities)`.
pub async fn find(
    client: &dyn WorkerClient,
    ctx: &CallContext,
    key: Vec<f32>,
    top_k: i32,
) -> WorkerResult<(Vec<Vec<f32>>, Vec<Vec<u8>>, Vec<f32>)> {
    let opts = StoresFindOptions {
        key: StoresKey::from(key),
        top_k,
    };
    let res = client.stores_find(ctx, opts).await?;
    Ok((
        res.keys.into_iter().map(|k| k.floats).collect(),
        res.values.into_iter().map(|v| v.bytes).collect(),
        res.similarities,
    ))
}

fn ensure_success(result: WireResult, op: &str) -> WorkerResult<()> {
    if result.success {
        Ok(())
    } else {
        Err(WorkerError::model(format!("store {} failed: {}", op, result.message)))
    }
}
