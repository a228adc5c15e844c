// Copyright (c) 2026 Meshnet
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![forbid(unsafe_code)]

//! Commit-reveal admission windows exercised through a live swarm.
//! Epochs are 100 blocks x 6 s = 600 s.

mod common;

use common::build_swarm;
use meshnet::chain::client::EpochClock;
use meshnet::chain::data::EpochData;
use meshnet::core::types::{commit_key, consensus_key, dht_time, reveal_key};
use meshnet::dht::storage::DhtValueView;
use meshnet::dht::transport::MeshTransport;

fn set_progress(clock: &EpochClock, epoch: u64, percent: f64) {
    let blocks_elapsed = (percent * 100.0).round() as u64;
    clock.set(EpochData::derive(epoch * 100 + blocks_elapsed, 100, 6.0, 0));
}

#[tokio::test]
async fn commit_reveal_windows_through_swarm() {
    let mesh = MeshTransport::new();
    let clock = EpochClock::new(EpochData::derive(300, 100, 6.0, 0));
    let nodes = build_swarm(&mesh, Some(clock.clone()), 4).await;
    let writer = &nodes[0];
    let subkey = writer.validator.local_subkey();

    // 10% into epoch 3: before the commit window opens.
    set_progress(&clock, 3, 0.10);
    assert!(
        !writer
            .dht
            .store(
                &commit_key(3),
                b"commitment".to_vec(),
                dht_time() + 1200.0,
                Some(subkey.clone()),
            )
            .await
    );

    // 20%: inside the window; a two-epoch expiration is the maximum allowed.
    set_progress(&clock, 3, 0.20);
    assert!(
        writer
            .dht
            .store(
                &commit_key(3),
                b"commitment".to_vec(),
                dht_time() + 1190.0,
                Some(subkey.clone()),
            )
            .await
    );

    // Readers see the committed value regardless of phase.
    set_progress(&clock, 3, 0.90);
    let found = nodes[2].dht.get_latest(&commit_key(3)).await.unwrap();
    match found.view {
        DhtValueView::Dictionary(map) => {
            assert_eq!(map[&subkey].0, b"commitment".to_vec());
        }
        DhtValueView::Regular(_) => panic!("commit keys hold dictionaries"),
    }
}

#[tokio::test]
async fn reveal_window_closes_at_sixty_percent() {
    let mesh = MeshTransport::new();
    let clock = EpochClock::new(EpochData::derive(300, 100, 6.0, 0));
    let nodes = build_swarm(&mesh, Some(clock.clone()), 3).await;
    let writer = &nodes[0];
    let subkey = writer.validator.local_subkey();

    set_progress(&clock, 3, 0.51);
    assert!(
        writer
            .dht
            .store(
                &reveal_key(3),
                b"reveal".to_vec(),
                dht_time() + 1190.0,
                Some(subkey.clone()),
            )
            .await
    );

    // Second peer, same window: per-peer quota still allows its single shot.
    let other = &nodes[1];
    assert!(
        other
            .dht
            .store(
                &reveal_key(3),
                b"reveal-2".to_vec(),
                dht_time() + 1190.0,
                Some(other.validator.local_subkey()),
            )
            .await
    );

    set_progress(&clock, 3, 0.61);
    assert!(
        !nodes[2]
            .dht
            .store(
                &reveal_key(3),
                b"late".to_vec(),
                dht_time() + 1190.0,
                Some(nodes[2].validator.local_subkey()),
            )
            .await
    );
}

#[tokio::test]
async fn consensus_key_deadline_and_quota() {
    let mesh = MeshTransport::new();
    let clock = EpochClock::new(EpochData::derive(300, 100, 6.0, 0));
    let nodes = build_swarm(&mesh, Some(clock.clone()), 3).await;
    let writer = &nodes[0];
    let subkey = writer.validator.local_subkey();

    set_progress(&clock, 3, 0.05);
    assert!(
        writer
            .dht
            .store(
                &consensus_key(3),
                b"scores".to_vec(),
                dht_time() + 1190.0,
                Some(subkey.clone()),
            )
            .await
    );

    // One consensus write per peer per epoch.
    assert!(
        !writer
            .dht
            .store(
                &consensus_key(3),
                b"scores-again".to_vec(),
                dht_time() + 1190.0,
                Some(subkey.clone()),
            )
            .await
    );

    // Past the 15% deadline the window is shut for everyone.
    set_progress(&clock, 3, 0.16);
    assert!(
        !nodes[1]
            .dht
            .store(
                &consensus_key(3),
                b"late-scores".to_vec(),
                dht_time() + 1190.0,
                Some(nodes[1].validator.local_subkey()),
            )
            .await
    );
}

#[tokio::test]
async fn excessive_expiration_is_rejected() {
    let mesh = MeshTransport::new();
    let clock = EpochClock::new(EpochData::derive(300, 100, 6.0, 0));
    let nodes = build_swarm(&mesh, Some(clock.clone()), 2).await;
    let writer = &nodes[0];

    set_progress(&clock, 3, 0.20);
    assert!(
        !writer
            .dht
            .store(
                &commit_key(3),
                b"greedy".to_vec(),
                dht_time() + 1300.0,
                Some(writer.validator.local_subkey()),
            )
            .await
    );
}
