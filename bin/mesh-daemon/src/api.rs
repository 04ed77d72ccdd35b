//! HTTP API over the service mesh

use http_body_util::{BodyExt, Full};
use hyper::{
    body::Bytes,
    header::{HeaderValue, CONTENT_TYPE},
    Method, Request, Response, StatusCode,
};
use mesh_api::Coordinates;
use mesh_core::MeshError;
use mesh_router::ServiceMesh;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    service_name: String,
    host: String,
    port: u16,
    #[serde(default)]
    region_id: Option<String>,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
struct HeartbeatRequest {
    #[serde(default)]
    load_score: f64,
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    message: String,
}

pub async fn handle_request(
    req: Request<hyper::body::Incoming>,
    mesh: Arc<ServiceMesh>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(str::to_string);

    debug!("{} {}", method, path);

    let body = req.into_body().collect().await?.to_bytes();
    Ok(dispatch(&mesh, &method, &path, query.as_deref(), &body).await)
}

/// Route one request to the mesh operation it names
pub async fn dispatch(
    mesh: &ServiceMesh,
    method: &Method,
    path: &str,
    query: Option<&str>,
    body: &[u8],
) -> Response<Full<Bytes>> {
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    let params = parse_query(query);

    match (method, segments.as_slice()) {
        (&Method::GET, ["healthz"]) => text(StatusCode::OK, "OK\n"),
        (&Method::GET, ["metrics"]) => match mesh.metrics().gather() {
            Ok(metrics) => {
                let mut response = text(StatusCode::OK, metrics);
                response.headers_mut().insert(
                    CONTENT_TYPE,
                    HeaderValue::from_static("text/plain; version=0.0.4"),
                );
                response
            }
            Err(e) => {
                warn!("Failed to gather metrics: {}", e);
                text(StatusCode::INTERNAL_SERVER_ERROR, "Failed to gather metrics\n")
            }
        },
        (&Method::GET, ["stats"]) => reply(mesh.get_mesh_statistics().await),
        (&Method::GET, ["regions"]) => reply(mesh.list_regions().await),
        (&Method::GET, ["regions", region_id, "health"]) => {
            reply(mesh.get_region_health(region_id).await)
        }
        (&Method::POST, ["instances"]) => {
            let request: RegisterRequest = match serde_json::from_slice(body) {
                Ok(request) => request,
                Err(e) => return bad_request(format!("invalid registration: {}", e)),
            };
            let result = match &request.region_id {
                Some(region_id) => {
                    mesh.register_in_region(
                        &request.service_name,
                        &request.host,
                        request.port,
                        region_id,
                        request.metadata,
                    )
                    .await
                }
                None => {
                    mesh.register(
                        &request.service_name,
                        &request.host,
                        request.port,
                        request.metadata,
                    )
                    .await
                }
            };
            match result {
                Ok(instance_id) => json(
                    StatusCode::CREATED,
                    &serde_json::json!({ "instance_id": instance_id }),
                ),
                Err(e) => error(e),
            }
        }
        (&Method::DELETE, ["instances", instance_id]) => {
            found_or_404(mesh.unregister(instance_id).await, instance_id)
        }
        (&Method::POST, ["instances", instance_id, "heartbeat"]) => {
            let request = if body.is_empty() {
                HeartbeatRequest::default()
            } else {
                match serde_json::from_slice::<HeartbeatRequest>(body) {
                    Ok(request) => request,
                    Err(e) => return bad_request(format!("invalid heartbeat: {}", e)),
                }
            };
            found_or_404(
                mesh.heartbeat(instance_id, request.load_score).await,
                instance_id,
            )
        }
        (&Method::GET, ["instances", service]) => {
            let instances = mesh.list_instances(service).await;
            json(StatusCode::OK, &instances)
        }
        (&Method::GET, ["route", service]) => {
            let result = match params.get("strategy") {
                Some(strategy) => mesh.route_named(service, strategy).await,
                None => mesh.route_default(service).await,
            };
            reply(result)
        }
        (&Method::GET, ["route-global", service]) => {
            let coords = match user_coordinates(&params) {
                Ok(coords) => coords,
                Err(message) => return bad_request(message),
            };
            let region = params.get("region").map(String::as_str);
            reply(mesh.route_global(service, region, coords).await)
        }
        (&Method::POST, ["outcomes", service, outcome]) => match *outcome {
            "success" => {
                mesh.report_success(service);
                circuit(mesh, service)
            }
            "failure" => {
                mesh.report_failure(service);
                circuit(mesh, service)
            }
            _ => bad_request(format!("unknown outcome {}", outcome)),
        },
        _ => text(StatusCode::NOT_FOUND, "Not Found\n"),
    }
}

fn parse_query(query: Option<&str>) -> BTreeMap<String, String> {
    form_urlencoded::parse(query.unwrap_or_default().as_bytes())
        .into_owned()
        .collect()
}

/// Optional user position from `lat`/`lon`, both or neither
fn user_coordinates(params: &BTreeMap<String, String>) -> Result<Option<Coordinates>, String> {
    let (lat, lon) = match (params.get("lat"), params.get("lon")) {
        (Some(lat), Some(lon)) => (lat, lon),
        (None, None) => return Ok(None),
        _ => return Err("lat and lon must be given together".to_string()),
    };
    let (lat, lon) = match (lat.trim().parse::<f64>(), lon.trim().parse::<f64>()) {
        (Ok(lat), Ok(lon)) => (lat, lon),
        _ => return Err("lat and lon must be numbers".to_string()),
    };
    if !lat.is_finite() || !(-90.0..=90.0).contains(&lat) {
        return Err(format!("lat {} is outside [-90, 90]", lat));
    }
    if !lon.is_finite() || !(-180.0..=180.0).contains(&lon) {
        return Err(format!("lon {} is outside [-180, 180]", lon));
    }
    Ok(Some(Coordinates::new(lat, lon)))
}

fn circuit(mesh: &ServiceMesh, service: &str) -> Response<Full<Bytes>> {
    json(
        StatusCode::OK,
        &serde_json::json!({ "service": service, "circuit": mesh.circuit_state(service) }),
    )
}

fn found_or_404(result: mesh_core::Result<bool>, instance_id: &str) -> Response<Full<Bytes>> {
    match result {
        Ok(true) => text(StatusCode::NO_CONTENT, ""),
        Ok(false) => error(MeshError::NotFound(format!("instance {}", instance_id))),
        Err(e) => error(e),
    }
}

fn reply<T: Serialize>(result: mesh_core::Result<T>) -> Response<Full<Bytes>> {
    match result {
        Ok(value) => json(StatusCode::OK, &value),
        Err(e) => error(e),
    }
}

fn status_for(err: &MeshError) -> StatusCode {
    match err {
        MeshError::NotFound(_) => StatusCode::NOT_FOUND,
        MeshError::Conflict(_) => StatusCode::CONFLICT,
        MeshError::CircuitOpen(_) | MeshError::StoreUnavailable(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        MeshError::InvalidStrategy(_) | MeshError::InvalidConfiguration(_) => {
            StatusCode::BAD_REQUEST
        }
        MeshError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error(err: MeshError) -> Response<Full<Bytes>> {
    let status = status_for(&err);
    json(
        status,
        &ErrorBody {
            error: err.reason(),
            message: err.to_string(),
        },
    )
}

fn bad_request(message: String) -> Response<Full<Bytes>> {
    json(
        StatusCode::BAD_REQUEST,
        &ErrorBody {
            error: "bad_request",
            message,
        },
    )
}

fn json<T: Serialize + ?Sized>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(value) {
        Ok(body) => {
            let mut response = Response::new(Full::new(Bytes::from(body)));
            *response.status_mut() = status;
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(e) => {
            warn!("Failed to encode response: {}", e);
            text(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error\n")
        }
    }
}

fn text(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}
