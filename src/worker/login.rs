//! Login and first-time app simulation

use rand::seq::SliceRandom;
use rand::Rng;
use tracing::{info, warn};

use super::{Session, SessionPhase, Worker};
use crate::pacing::random_sleep;
use crate::rpc::payload::{decode, InventoryResponse, PlayerResponse};
use crate::rpc::{Avatar, ChainOptions, Envelope, RpcCall};
use crate::status::WorkerStatus;
use crate::types::{now_ms, Result, ScanError};

/// Tutorial steps a fully set up account has completed
const TUTORIAL_STEPS: [u32; 5] = [0, 1, 3, 4, 7];
const STARTERS: [u32; 3] = [1, 4, 7];
const PLATFORM_IOS: u32 = 1;
const STARTER_ASSETS: [&str; 3] = [
    "1a3c2816-65fa-4b97-90eb-0b301c064b7a/1477084786906000",
    "aa8f7687-a022-4773-b900-3a8c170e9aea/1477084794890000",
    "e89109b0-9a54-40fe-8431-12f7826c8194/1477084802881000",
];

impl Worker {
    /// Authenticate the session, running the app simulation the first time.
    ///
    /// Returns `Ok(false)` when the worker was killed mid-login.
    pub(crate) async fn login(&self, session: &mut Session) -> Result<bool> {
        let result = self.login_inner(session).await;
        if !matches!(result, Ok(true)) {
            session.phase = SessionPhase::Unauthenticated;
        }
        result
    }

    async fn login_inner(&self, session: &mut Session) -> Result<bool> {
        self.set_status(WorkerStatus::Login);
        info!(worker = self.id, username = %session.identity.username, "Trying to log in");

        {
            let _permit = self
                .ctx
                .login_gate
                .acquire()
                .await
                .map_err(|_| ScanError::Internal("login gate closed".into()))?;
            random_sleep(0.5, 1.5).await;

            session.phase = SessionPhase::Authenticating;
            let client = session.client();
            let username = session.identity.username.clone();
            let password = session.identity.password.clone();
            let provider = session.identity.provider;
            let credentials = self
                .ctx
                .network
                .run(move || client.authenticate(&username, password.as_deref(), provider))
                .await?;
            session.identity.credentials = Some(credentials);
        }

        if self.is_killed() {
            return Ok(false);
        }

        if !session.ever_authenticated {
            let _permit = self
                .ctx
                .simulation_gate
                .acquire()
                .await
                .map_err(|_| ScanError::Internal("simulation gate closed".into()))?;
            session.phase = SessionPhase::SimulatingClient;
            self.simulate_app(session).await?;
        }

        session.ever_authenticated = true;
        session.phase = SessionPhase::Authenticated;
        session.account_start_ms = Some(now_ms());
        self.set_status(WorkerStatus::Healthy);
        self.track(session);
        Ok(true)
    }

    /// The call sequence a real client makes right after a fresh login
    pub(crate) async fn simulate_app(&self, session: &mut Session) -> Result<()> {
        self.set_status(WorkerStatus::AppSimulation);
        info!(worker = self.id, "Starting app simulation");
        let settings = &self.ctx.settings;

        self.send_raw(session, Envelope::empty()).await?;
        random_sleep(0.3, 0.5).await;
        self.send_raw(session, Envelope::empty()).await?;
        random_sleep(0.2, 0.4).await;

        let response = self
            .send_raw(
                session,
                Envelope::single(RpcCall::GetPlayer {
                    player_locale: settings.locale.clone(),
                }),
            )
            .await?;
        let player = match response.get("responses").and_then(|r| r.get("GET_PLAYER")) {
            Some(value) if !value.is_null() => decode::<PlayerResponse>("GET_PLAYER", value)?,
            _ => PlayerResponse::default(),
        };
        if player.banned {
            return Err(ScanError::AccountBanned);
        }
        session.item_capacity = player
            .player_data
            .max_item_storage
            .unwrap_or(settings.item_capacity);
        let tutorial_state = player.player_data.tutorial_state;
        random_sleep(0.9, 1.2).await;

        let responses = self
            .chain(
                session,
                RpcCall::DownloadRemoteConfigVersion {
                    platform: PLATFORM_IOS,
                    app_version: settings.app_version,
                },
                ChainOptions {
                    stamp: false,
                    buddy: false,
                    settings_hash: false,
                },
            )
            .await?;
        let inventory: InventoryResponse = responses.decode_or_default("GET_INVENTORY")?;
        let player_level = inventory.inventory_delta.player_level();
        random_sleep(0.5, 0.7).await;

        self.chain(
            session,
            RpcCall::GetAssetDigest {
                platform: PLATFORM_IOS,
                app_version: settings.app_version,
            },
            ChainOptions::without_buddy(),
        )
        .await?;
        random_sleep(1.2, 1.4).await;

        let tutorial_done = TUTORIAL_STEPS.iter().all(|s| tutorial_state.contains(s));
        if settings.complete_tutorial && !tutorial_done {
            self.complete_tutorial(session, &tutorial_state).await?;
        } else {
            self.chain(session, RpcCall::GetPlayerProfile, ChainOptions::default())
                .await?;
            random_sleep(0.2, 0.4).await;
        }

        match player_level {
            Some(level) => {
                self.chain(session, RpcCall::LevelUpRewards { level }, ChainOptions::default())
                    .await?;
                random_sleep(0.9, 1.1).await;
            }
            None => warn!(worker = self.id, "No player level"),
        }

        self.chain(
            session,
            RpcCall::RegisterBackgroundDevice {
                device_type: "apple_watch".to_string(),
            },
            ChainOptions::default(),
        )
        .await?;
        session.identity.last_action_ms = now_ms();
        random_sleep(0.1, 0.3).await;

        info!(worker = self.id, "Finished app simulation");
        self.set_status(WorkerStatus::Healthy);
        Ok(())
    }

    /// Run the tutorial steps missing from `state`
    pub(crate) async fn complete_tutorial(&self, session: &mut Session, state: &[u32]) -> Result<()> {
        self.set_status(WorkerStatus::Tutorial);
        warn!(worker = self.id, username = %session.identity.username, "Starting tutorial");
        let locale = self.ctx.settings.locale.clone();

        if !state.contains(&0) {
            random_sleep(1.0, 5.0).await;
            self.chain(
                session,
                RpcCall::MarkTutorialComplete {
                    tutorials_completed: 0,
                },
                ChainOptions::without_buddy(),
            )
            .await?;
        }

        if !state.contains(&1) {
            random_sleep(5.0, 12.0).await;
            let avatar = random_avatar();
            self.chain(
                session,
                RpcCall::SetAvatar {
                    player_avatar: avatar,
                },
                ChainOptions::without_buddy(),
            )
            .await?;
            random_sleep(0.3, 0.5).await;
            self.chain(
                session,
                RpcCall::MarkTutorialComplete {
                    tutorials_completed: 1,
                },
                ChainOptions::without_buddy(),
            )
            .await?;
        }

        random_sleep(0.5, 0.6).await;
        self.chain(session, RpcCall::GetPlayerProfile, ChainOptions::default())
            .await?;

        let mut starter_id = None;
        if !state.contains(&3) {
            random_sleep(1.0, 1.5).await;
            self.chain(
                session,
                RpcCall::GetDownloadUrls {
                    asset_id: STARTER_ASSETS.iter().map(|s| s.to_string()).collect(),
                },
                ChainOptions::default(),
            )
            .await?;

            random_sleep(1.0, 1.6).await;
            self.send_raw(session, Envelope::empty()).await?;

            random_sleep(6.0, 13.0).await;
            let starter = *STARTERS
                .choose(&mut rand::thread_rng())
                .unwrap_or(&STARTERS[0]);
            self.chain(
                session,
                RpcCall::EncounterTutorialComplete { pokemon_id: starter },
                ChainOptions::default(),
            )
            .await?;

            random_sleep(0.5, 0.6).await;
            let responses = self
                .chain(
                    session,
                    RpcCall::GetPlayer {
                        player_locale: locale.clone(),
                    },
                    ChainOptions::default(),
                )
                .await?;
            let inventory: InventoryResponse = responses.decode_or_default("GET_INVENTORY")?;
            starter_id = inventory.inventory_delta.last_owned();
        }

        if !state.contains(&4) {
            random_sleep(5.0, 12.0).await;
            let codename = session.identity.username.clone();
            self.chain(session, RpcCall::ClaimCodename { codename }, ChainOptions::default())
                .await?;

            random_sleep(1.0, 1.3).await;
            self.chain(
                session,
                RpcCall::MarkTutorialComplete {
                    tutorials_completed: 4,
                },
                ChainOptions::without_buddy(),
            )
            .await?;

            random_sleep(0.1, 0.1).await;
            self.chain(
                session,
                RpcCall::GetPlayer {
                    player_locale: locale,
                },
                ChainOptions::default(),
            )
            .await?;
        }

        if !state.contains(&7) {
            random_sleep(4.0, 10.0).await;
            self.chain(
                session,
                RpcCall::MarkTutorialComplete {
                    tutorials_completed: 7,
                },
                ChainOptions::default(),
            )
            .await?;
        }

        if let Some(pokemon_id) = starter_id {
            random_sleep(3.0, 5.0).await;
            self.chain(
                session,
                RpcCall::SetBuddyPokemon { pokemon_id },
                ChainOptions::default(),
            )
            .await?;
            random_sleep(0.8, 1.8).await;
        }

        random_sleep(0.2, 0.2).await;
        Ok(())
    }
}

fn random_avatar() -> Avatar {
    let mut rng = rand::thread_rng();
    Avatar {
        hair: rng.gen_range(1..=5),
        shirt: rng.gen_range(1..=3),
        pants: rng.gen_range(1..=2),
        shoes: rng.gen_range(1..=6),
        gender: rng.gen_range(0..=1),
        eyes: rng.gen_range(1..=4),
        backpack: rng.gen_range(1..=5),
    }
}
