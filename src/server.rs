// HTTP trigger for gestures
//
// GET /run?emotion=<name> builds a controller, performs the gesture and shuts
// the controller down again. Requests share one physical robot, so they run
// one at a time.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::gestures::{self, Emotion};
use crate::messages::{ErrorResponse, HealthResponse, HealthStatus, RunQuery, RunResponse};
use crate::motor::robot::{Robot, RobotError};
use crate::motor::transport::BoxedTransport;

/// Builds a connected controller for one request
pub type RobotFactory =
    Arc<dyn Fn() -> Result<Robot<BoxedTransport>, RobotError> + Send + Sync>;

#[derive(Clone)]
pub struct AppState {
    factory: RobotFactory,
    hardware: Arc<Mutex<()>>,
}

impl AppState {
    pub fn new(
        factory: impl Fn() -> Result<Robot<BoxedTransport>, RobotError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            factory: Arc::new(factory),
            hardware: Arc::new(Mutex::new(())),
        }
    }
}

/// Build the application router with the provided state.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/run", get(run_gesture))
        .route("/health", get(health))
        .with_state(state)
}

/// Serve the trigger until the process is stopped
pub async fn serve(addr: &str, state: AppState) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app(state)).await
}

fn perform_blocking(factory: RobotFactory, emotion: Emotion) -> Result<(), RobotError> {
    let mut robot = factory()?;
    let performed = gestures::perform(emotion, &mut robot);
    let shutdown = robot.clean_shutdown();
    performed.and(shutdown)
}

pub async fn run_gesture(State(state): State<AppState>, Query(query): Query<RunQuery>) -> Response {
    info!("Received emotion: {:?}", query.emotion);

    let requested = query.emotion.unwrap_or_default();
    let emotion = match requested.parse::<Emotion>() {
        Ok(emotion) => emotion,
        Err(e) => {
            warn!("{}", e);
            let body = ErrorResponse {
                error: "Unknown emotion".to_string(),
            };
            return (StatusCode::BAD_REQUEST, Json(body)).into_response();
        }
    };

    // Held by the worker until the gesture ends, even if this request is dropped
    let hardware = state.hardware.clone().lock_owned().await;
    let factory = state.factory.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        let _hardware = hardware;
        perform_blocking(factory, emotion)
    })
    .await;

    match outcome {
        Ok(Ok(())) => {
            info!("Gesture {} complete", emotion);
            (StatusCode::OK, Json(RunResponse::success(requested))).into_response()
        }
        Ok(Err(e)) => {
            error!("Gesture {} failed: {}", emotion, e);
            (StatusCode::INTERNAL_SERVER_ERROR, Json(RunResponse::failed(requested))).into_response()
        }
        Err(e) => {
            error!("Gesture {} worker aborted: {}", emotion, e);
            (StatusCode::INTERNAL_SERVER_ERROR, Json(RunResponse::failed(requested))).into_response()
        }
    }
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: HealthStatus::Ok,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::config::RobotConfig;
    use crate::motor::clock::ManualClock;
    use crate::motor::sim::SimulatedBus;
    use crate::motor::transport::BusError;

    const LAB_CONFIG: &str = include_str!("../config/robot_330_lab.json");

    fn simulated_state(calls: Arc<AtomicUsize>) -> AppState {
        AppState::new(move || {
            calls.fetch_add(1, Ordering::SeqCst);
            let config = RobotConfig::from_json(LAB_CONFIG)?;
            let bus: BoxedTransport = Box::new(SimulatedBus::from_config(&config));
            Robot::with_clock(config, bus, Arc::new(ManualClock::new()))
        })
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn query(emotion: Option<&str>) -> Query<RunQuery> {
        Query(RunQuery {
            emotion: emotion.map(str::to_string),
        })
    }

    #[tokio::test]
    async fn test_unknown_emotion_is_rejected_without_hardware() {
        let calls = Arc::new(AtomicUsize::new(0));
        let state = simulated_state(calls.clone());

        for emotion in [Some("boredom"), None] {
            let response = run_gesture(State(state.clone()), query(emotion)).await;
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
            assert_eq!(
                body_json(response).await,
                serde_json::json!({"error": "Unknown emotion"})
            );
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_known_emotion_runs_gesture() {
        let calls = Arc::new(AtomicUsize::new(0));
        let state = simulated_state(calls.clone());

        let response = run_gesture(State(state), query(Some("gratitude"))).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_json(response).await,
            serde_json::json!({"status": "success", "executed": "gratitude"})
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_controller_failure_reports_failed() {
        let state = AppState::new(|| Err(RobotError::Bus(BusError::NotOpen)));
        let response = run_gesture(State(state), query(Some("angry"))).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            body_json(response).await,
            serde_json::json!({"status": "failed", "executed": "angry"})
        );
    }

    #[tokio::test]
    async fn test_dropped_request_keeps_hardware_locked() {
        let live = Arc::new(AtomicUsize::new(0));
        let most = Arc::new(AtomicUsize::new(0));
        let state = {
            let (live, most) = (live.clone(), most.clone());
            AppState::new(move || {
                let now = live.fetch_add(1, Ordering::SeqCst) + 1;
                most.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(400));
                live.fetch_sub(1, Ordering::SeqCst);
                Err(RobotError::Bus(BusError::NotOpen))
            })
        };

        let first = tokio::spawn(run_gesture(State(state.clone()), query(Some("calming"))));
        tokio::time::sleep(Duration::from_millis(100)).await;
        first.abort();

        let response = run_gesture(State(state), query(Some("calming"))).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(most.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_health() {
        let Json(response) = health().await;
        assert_eq!(response.status, HealthStatus::Ok);
    }
}
