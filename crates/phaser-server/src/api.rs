use axum::extract::State;
use axum::response::Json;
use serde::Serialize;

use phaser_core::game::GameConfig;

use crate::config::validate_game_config;
use crate::error::AppError;
use crate::session::SessionStatus;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct ConfigResponse {
    pub config: GameConfig,
    pub devices_notified: usize,
}

pub async fn get_status(State(state): State<AppState>) -> Json<SessionStatus> {
    Json(state.sessions.read().await.status())
}

pub async fn get_config(State(state): State<AppState>) -> Json<GameConfig> {
    Json(state.sessions.read().await.config().clone())
}

/// Replace the game rules and push them to every connected device.
pub async fn put_config(
    State(state): State<AppState>,
    Json(config): Json<GameConfig>,
) -> Result<Json<ConfigResponse>, AppError> {
    validate_game_config(&config).map_err(|e| AppError::BadRequest(e.to_string()))?;
    let devices_notified = state.sessions.write().await.set_config(config.clone());
    Ok(Json(ConfigResponse {
        config,
        devices_notified,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use phaser_core::game::GameMode;
    use phaser_core::test_helpers::make_identity;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn put_config_notifies_devices() {
        let state = AppState::new(ServerConfig::default());
        let (tx, _rx) = mpsc::channel(16);
        state
            .sessions
            .write()
            .await
            .register(make_identity(5, 2, 1), tx)
            .unwrap();

        let config = GameConfig {
            mode: GameMode::Team,
            ..GameConfig::default()
        };
        let Json(resp) = put_config(State(state.clone()), Json(config.clone()))
            .await
            .unwrap();
        assert_eq!(resp.devices_notified, 1);

        let Json(current) = get_config(State(state.clone())).await;
        assert_eq!(current, config);
        let Json(status) = get_status(State(state)).await;
        assert_eq!(status.config.mode, GameMode::Team);
        assert_eq!(status.devices.len(), 1);
    }

    #[tokio::test]
    async fn unplayable_config_is_rejected() {
        let state = AppState::new(ServerConfig::default());
        let config = GameConfig {
            max_hearts: 0,
            ..GameConfig::default()
        };
        let result = put_config(State(state.clone()), Json(config)).await;
        assert!(matches!(result, Err(AppError::BadRequest(_))));
        let Json(current) = get_config(State(state)).await;
        assert_eq!(current, GameConfig::default());
    }
}
