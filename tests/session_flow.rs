use pokersync::config::SyncConfig;
use pokersync::identity::Invitation;
use pokersync::round::RoundPhase;
use pokersync::session::{Session, SessionEvent};
use pokersync::store::LocalStore;
use pokersync::transport::SharedMedia;
use pokersync::types::Ticket;
use std::time::Duration;

fn client(media: &SharedMedia) -> Session {
    Session::new(SyncConfig::default(), LocalStore::in_memory(), media.clone())
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(200)).await;
}

fn backlog() -> Vec<Ticket> {
    vec![
        Ticket::new("PP-1", "Checkout"),
        Ticket::new("PP-2", "Login"),
        Ticket::new("PP-3", "Search"),
    ]
}

#[tokio::test(start_paused = true)]
async fn test_participant_receives_host_list() {
    let media = SharedMedia::new();
    let host = client(&media);
    host.create("Sprint 12", "Fibonacci (0, 1, 2, 3, 5...)").await;
    host.import_tickets(backlog()).await;

    let url = host.invitation().await.to_url("https://poker.example");
    let invitation = Invitation::parse(&url).unwrap();

    let participant = client(&media);
    participant.join(&invitation).await;
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert!(!participant.is_host().await);
    assert_eq!(participant.session_id().await, host.session_id().await);
    assert_eq!(participant.tickets(), host.tickets());
    assert_eq!(
        participant.store().game_name().as_deref(),
        Some("Sprint 12")
    );

    participant.teardown().await;
    host.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn test_full_round_across_clients() {
    let media = SharedMedia::new();
    let host = client(&media);
    host.create("Sprint 12", "Fibonacci (0, 1, 2, 3, 5...)").await;
    host.import_tickets(backlog()).await;
    let invitation = host.invitation().await;

    let mut participants = Vec::new();
    for _ in 0..3 {
        let participant = client(&media);
        participant.join(&invitation).await;
        participants.push(participant);
    }
    tokio::time::sleep(Duration::from_secs(2)).await;

    host.select_ticket("PP-1").await.unwrap();
    settle().await;
    for participant in &participants {
        assert_eq!(participant.phase().await, RoundPhase::TicketSelected);
    }

    for (participant, card) in participants.iter().zip([3.0, 5.0, 0.0]) {
        participant.vote(card).await.unwrap();
    }
    host.vote(8.0).await.unwrap();
    settle().await;
    assert_eq!(host.round().await.votes().len(), 4);

    let mut host_events = host.subscribe();
    host.start_countdown().await.unwrap();
    settle().await;
    assert!(matches!(
        participants[0].phase().await,
        RoundPhase::CountingDown { .. }
    ));
    assert_eq!(
        participants[1].vote(13.0).await,
        Err(pokersync::error::RoundError::CountdownInProgress)
    );

    tokio::time::sleep(Duration::from_secs(5)).await;

    let mut revealed = None;
    while let Ok(event) = host_events.try_recv() {
        if let SessionEvent::Revealed { average } = event {
            revealed = average;
        }
    }
    assert_eq!(revealed, Some(5.3));

    for session in std::iter::once(&host).chain(participants.iter()) {
        assert_eq!(session.phase().await, RoundPhase::Idle);
        assert!(session.round().await.votes().is_empty());
        let estimated = session
            .tickets()
            .into_iter()
            .find(|t| t.key == "PP-1")
            .unwrap();
        assert_eq!(estimated.story_point, Some(5.3));
    }

    for participant in &participants {
        participant.teardown().await;
    }
    host.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn test_reset_clears_votes_everywhere() {
    let media = SharedMedia::new();
    let host = client(&media);
    host.create("Sprint", "Fibonacci").await;
    host.import_tickets(backlog()).await;

    let participant = client(&media);
    participant.join(&host.invitation().await).await;
    tokio::time::sleep(Duration::from_secs(2)).await;

    host.select_ticket("PP-2").await.unwrap();
    settle().await;
    participant.vote(5.0).await.unwrap();
    settle().await;
    assert_eq!(host.round().await.votes().len(), 1);

    host.reset_voting().await;
    settle().await;
    assert!(host.round().await.votes().is_empty());
    assert!(participant.round().await.votes().is_empty());
    assert_eq!(participant.phase().await, RoundPhase::TicketSelected);

    participant.teardown().await;
    host.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn test_force_sync_recovers_cleared_participant() {
    let media = SharedMedia::new();
    let host = client(&media);
    host.create("Sprint", "Fibonacci").await;
    host.import_tickets(backlog()).await;

    let participant = client(&media);
    participant.join(&host.invitation().await).await;
    tokio::time::sleep(Duration::from_secs(2)).await;

    participant.store().clear_tickets();
    participant.force_sync().await;
    settle().await;
    assert_eq!(participant.tickets().len(), 3);

    participant.teardown().await;
    host.teardown().await;
}
