use std::{sync::Arc, time::Duration};

use axum::{
    body::Body,
    extract::{DefaultBodyLimit, MatchedPath, Multipart, Path, Query, Request, State},
    http::Method,
    response::Response,
    routing::{delete, get, post, put},
    Json,
    Router,
};
use blob_store::{PackageStore, PutResult};
use data_model::{
    ExecutionId,
    FunctionBuilder,
    FunctionId,
    JobBuilder,
    JobId,
    PackageRef,
    RuntimeId,
};
use futures::StreamExt;
use processor::{
    dispatcher::{Dispatcher, SubmitMode, SubmitRequest},
    pool::PoolSnapshot,
};
use state_store::MetadataStore;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;

use crate::{
    http_objects::{
        CreateJob,
        CreateRuntime,
        ExecutionOut,
        FunctionManifest,
        FunctionOut,
        FunctionsList,
        InvokeParams,
        JobOut,
        JobsList,
        KilnAPIError,
        RuntimeOut,
        RuntimesList,
        ScaleDownResponse,
        ScaleRequest,
        ScaleUpResponse,
        UpdateRuntimeImage,
    },
    runtimes::RuntimeManager,
};

#[derive(Clone)]
pub struct RouteState {
    pub store: Arc<dyn MetadataStore>,
    pub dispatcher: Arc<Dispatcher>,
    pub runtimes: Arc<RuntimeManager>,
    pub packages: Arc<PackageStore>,
}

pub fn create_routes(route_state: RouteState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_origin(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(index))
        .route("/healthz", get(healthz))
        .route(
            "/v1/runtimes",
            post(create_runtime).with_state(route_state.clone()),
        )
        .route(
            "/v1/runtimes",
            get(list_runtimes).with_state(route_state.clone()),
        )
        .route(
            "/v1/runtimes/{runtime}",
            get(get_runtime).with_state(route_state.clone()),
        )
        .route(
            "/v1/runtimes/{runtime}",
            delete(delete_runtime).with_state(route_state.clone()),
        )
        .route(
            "/v1/runtimes/{runtime}/image",
            put(update_runtime_image).with_state(route_state.clone()),
        )
        .route(
            "/v1/runtimes/{runtime}/scale_up",
            post(scale_up).with_state(route_state.clone()),
        )
        .route(
            "/v1/runtimes/{runtime}/scale_down",
            post(scale_down).with_state(route_state.clone()),
        )
        .route(
            "/v1/runtimes/{runtime}/pool",
            get(pool_status).with_state(route_state.clone()),
        )
        .route(
            "/v1/functions",
            post(create_function).with_state(route_state.clone()),
        )
        .route(
            "/v1/functions",
            get(list_functions).with_state(route_state.clone()),
        )
        .route(
            "/v1/functions/{function}",
            get(get_function).with_state(route_state.clone()),
        )
        .route(
            "/v1/functions/{function}",
            delete(delete_function).with_state(route_state.clone()),
        )
        .route(
            "/v1/functions/{function}/code",
            get(download_code).with_state(route_state.clone()),
        )
        .route(
            "/v1/functions/{function}/invoke",
            post(invoke_function).with_state(route_state.clone()),
        )
        .route(
            "/v1/executions/{execution}",
            get(get_execution).with_state(route_state.clone()),
        )
        .route(
            "/v1/jobs",
            post(create_job).with_state(route_state.clone()),
        )
        .route(
            "/v1/jobs",
            get(list_jobs).with_state(route_state.clone()),
        )
        .route(
            "/v1/jobs/{job}",
            get(get_job).with_state(route_state.clone()),
        )
        .route(
            "/v1/jobs/{job}",
            delete(delete_job).with_state(route_state.clone()),
        )
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &Request| {
                    let method = req.method();
                    let uri = req.uri();

                    let matched_path = req
                        .extensions()
                        .get::<MatchedPath>()
                        .map(|matched_path| matched_path.as_str());

                    tracing::debug_span!("request", %method, %uri, matched_path)
                })
                .on_failure(()),
        )
        .layer(cors)
        .layer(DefaultBodyLimit::max(usize::MAX))
}

async fn index() -> &'static str {
    "Kiln Server"
}

async fn healthz() -> &'static str {
    "ok"
}

async fn create_runtime(
    State(state): State<RouteState>,
    Json(request): Json<CreateRuntime>,
) -> Result<Json<RuntimeOut>, KilnAPIError> {
    let stored = state
        .runtimes
        .create_runtime(request.name, request.image, request.pool)
        .await?;
    Ok(Json(stored.into()))
}

async fn list_runtimes(
    State(state): State<RouteState>,
) -> Result<Json<RuntimesList>, KilnAPIError> {
    let runtimes = state.runtimes.list_runtimes().await?;
    Ok(Json(RuntimesList {
        runtimes: runtimes.into_iter().map(|r| r.into()).collect(),
    }))
}

async fn get_runtime(
    Path(runtime): Path<String>,
    State(state): State<RouteState>,
) -> Result<Json<RuntimeOut>, KilnAPIError> {
    let stored = state.runtimes.runtime(&RuntimeId::new(runtime)).await?;
    Ok(Json(stored.into()))
}

async fn delete_runtime(
    Path(runtime): Path<String>,
    State(state): State<RouteState>,
) -> Result<(), KilnAPIError> {
    state
        .runtimes
        .delete_runtime(&RuntimeId::new(runtime))
        .await?;
    Ok(())
}

async fn update_runtime_image(
    Path(runtime): Path<String>,
    State(state): State<RouteState>,
    Json(request): Json<UpdateRuntimeImage>,
) -> Result<Json<RuntimeOut>, KilnAPIError> {
    let stored = state
        .runtimes
        .update_runtime_image(&RuntimeId::new(runtime), request.image)
        .await?;
    Ok(Json(stored.into()))
}

async fn scale_up(
    Path(runtime): Path<String>,
    State(state): State<RouteState>,
    Json(request): Json<ScaleRequest>,
) -> Result<Json<ScaleUpResponse>, KilnAPIError> {
    let desired = state
        .runtimes
        .scale_up(&RuntimeId::new(runtime), request.count)
        .await?;
    Ok(Json(ScaleUpResponse { desired }))
}

async fn scale_down(
    Path(runtime): Path<String>,
    State(state): State<RouteState>,
    Json(request): Json<ScaleRequest>,
) -> Result<Json<ScaleDownResponse>, KilnAPIError> {
    let removed = state
        .runtimes
        .scale_down(&RuntimeId::new(runtime), request.count)
        .await?;
    Ok(Json(ScaleDownResponse { removed }))
}

async fn pool_status(
    Path(runtime): Path<String>,
    State(state): State<RouteState>,
) -> Result<Json<PoolSnapshot>, KilnAPIError> {
    let snapshot = state
        .runtimes
        .pool_status(&RuntimeId::new(runtime))
        .await?;
    Ok(Json(snapshot))
}

async fn create_function(
    State(state): State<RouteState>,
    mut function_code: Multipart,
) -> Result<Json<FunctionOut>, KilnAPIError> {
    let mut manifest: Option<FunctionManifest> = None;
    let mut put_result: Option<PutResult> = None;
    while let Some(field) = function_code
        .next_field()
        .await
        .map_err(|err| KilnAPIError::internal_error(anyhow::anyhow!(err)))?
    {
        let name = field.name();
        if let Some(name) = name {
            if name == "code" {
                let stream = field.map(|res| res.map_err(|err| anyhow::anyhow!(err)));
                let result = state
                    .packages
                    .put(stream)
                    .await
                    .map_err(KilnAPIError::internal_error)?;
                put_result = Some(result);
            } else if name == "function" {
                let text = field
                    .text()
                    .await
                    .map_err(|e| KilnAPIError::bad_request(&e.to_string()))?;
                manifest = Some(serde_json::from_str(&text)?);
            }
        }
    }

    let manifest = manifest.ok_or(KilnAPIError::bad_request("function manifest is required"))?;
    let put_result = put_result.ok_or(KilnAPIError::bad_request("code is required"))?;

    let runtime_id = RuntimeId::new(manifest.runtime_id.clone());
    state.runtimes.runtime(&runtime_id).await?;

    let code = PackageRef {
        url: put_result.url,
        size: put_result.size_bytes,
        sha256_hash: put_result.sha256_hash,
    };
    let existing = state.store.list_functions().await?;
    let previous = existing
        .iter()
        .filter(|f| f.record.name == manifest.name && f.record.runtime_id == runtime_id)
        .max_by_key(|f| f.record.version);

    let function = match previous {
        // Re-publishing an existing name rolls the code forward under a new
        // id; the rest of the definition carries over from the previous
        // version.
        Some(previous) => previous.record.new_version(code),
        None => {
            let mut builder = FunctionBuilder::default();
            builder
                .name(manifest.name)
                .runtime_id(runtime_id)
                .code(code)
                .idempotent(manifest.idempotent);
            if let Some(timeout_ms) = manifest.timeout_ms {
                builder.timeout_ms(timeout_ms);
            }
            if let Some(max_concurrency) = manifest.max_concurrency {
                builder.max_concurrency(max_concurrency);
            }
            if let Some(resources) = manifest.resources {
                builder.resources(resources);
            }
            builder
                .build()
                .map_err(|e| KilnAPIError::bad_request(&e.to_string()))?
        }
    };
    let stored = state.store.create_function(function).await?;
    info!(
        function_id = stored.record.id.get(),
        name = stored.record.name.as_str(),
        version = stored.record.version,
        "Function created"
    );
    Ok(Json(stored.into()))
}

async fn list_functions(
    State(state): State<RouteState>,
) -> Result<Json<FunctionsList>, KilnAPIError> {
    let functions = state.store.list_functions().await?;
    Ok(Json(FunctionsList {
        functions: functions.into_iter().map(|f| f.into()).collect(),
    }))
}

async fn get_function(
    Path(function): Path<String>,
    State(state): State<RouteState>,
) -> Result<Json<FunctionOut>, KilnAPIError> {
    let stored = state
        .store
        .function(&FunctionId::new(function))
        .await?
        .ok_or_else(|| KilnAPIError::not_found("function not found"))?;
    Ok(Json(stored.into()))
}

/// Removes the function record. The code bundle stays in the package store;
/// it is content-addressed and other versions may still reference it.
async fn delete_function(
    Path(function): Path<String>,
    State(state): State<RouteState>,
) -> Result<(), KilnAPIError> {
    let function_id = FunctionId::new(function);
    state.store.remove_function(&function_id).await?;
    state.dispatcher.forget_function(&function_id);
    info!(function_id = function_id.get(), "Function deleted");
    Ok(())
}

async fn download_code(
    Path(function): Path<String>,
    State(state): State<RouteState>,
) -> Result<Response<Body>, KilnAPIError> {
    let stored = state
        .store
        .function(&FunctionId::new(function))
        .await?
        .ok_or_else(|| KilnAPIError::not_found("function not found"))?;
    let storage_reader = state
        .packages
        .get(&stored.record.code.url)
        .await
        .map_err(KilnAPIError::internal_error)?;
    Response::builder()
        .header("Content-Type", "application/octet-stream")
        .header("Content-Length", stored.record.code.size.to_string())
        .body(Body::from_stream(storage_reader))
        .map_err(|e| KilnAPIError::internal_error_str(&e.to_string()))
}

async fn invoke_function(
    Path(function): Path<String>,
    Query(params): Query<InvokeParams>,
    State(state): State<RouteState>,
    Json(input): Json<serde_json::Value>,
) -> Result<Json<ExecutionOut>, KilnAPIError> {
    let mode = if params.sync {
        SubmitMode::Sync
    } else {
        SubmitMode::Async
    };
    let request = SubmitRequest {
        function_id: FunctionId::new(function),
        input,
        mode,
        deadline: params.deadline_ms.map(Duration::from_millis),
        job_id: None,
    };
    let execution = state.dispatcher.submit(request).await?;
    Ok(Json(execution.into()))
}

async fn get_execution(
    Path(execution): Path<String>,
    State(state): State<RouteState>,
) -> Result<Json<ExecutionOut>, KilnAPIError> {
    let stored = state
        .store
        .execution(&ExecutionId::new(execution))
        .await?
        .ok_or_else(|| KilnAPIError::not_found("execution not found"))?;
    Ok(Json(stored.into()))
}

async fn create_job(
    State(state): State<RouteState>,
    Json(request): Json<CreateJob>,
) -> Result<Json<JobOut>, KilnAPIError> {
    let function_id = FunctionId::new(request.function_id);
    state
        .store
        .function(&function_id)
        .await?
        .ok_or_else(|| KilnAPIError::not_found("function not found"))?;
    let job = JobBuilder::default()
        .function_id(function_id)
        .schedule(request.schedule)
        .input(request.input)
        .build()
        .map_err(|e| KilnAPIError::bad_request(&e.to_string()))?;
    let stored = state.store.create_job(job).await?;
    info!(
        job_id = stored.record.id.get(),
        schedule = %stored.record.schedule,
        "Job created"
    );
    Ok(Json(stored.into()))
}

async fn list_jobs(State(state): State<RouteState>) -> Result<Json<JobsList>, KilnAPIError> {
    let jobs = state.store.list_jobs().await?;
    Ok(Json(JobsList {
        jobs: jobs.into_iter().map(|j| j.into()).collect(),
    }))
}

async fn get_job(
    Path(job): Path<String>,
    State(state): State<RouteState>,
) -> Result<Json<JobOut>, KilnAPIError> {
    let stored = state
        .store
        .job(&JobId::new(job))
        .await?
        .ok_or_else(|| KilnAPIError::not_found("job not found"))?;
    Ok(Json(stored.into()))
}

async fn delete_job(
    Path(job): Path<String>,
    State(state): State<RouteState>,
) -> Result<(), KilnAPIError> {
    let job_id = JobId::new(job);
    state.store.remove_job(&job_id).await?;
    info!(job_id = job_id.get(), "Job deleted");
    Ok(())
}
