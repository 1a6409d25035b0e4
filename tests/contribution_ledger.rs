mod common;

use civic_intake::services::feed_service::{FeedInput, FeedQuery, ReactInput, ShareInput};
use civic_intake::services::poll_service::{PollInput, PollView, VoteInput};
use civic_intake::services::user_service::RegisterInput;
use civic_intake::ledger::Outcome;
use civic_intake::CivicError;
use common::Harness;

fn poll_input(options: &[&str], allow_multiple: bool) -> PollInput {
    PollInput {
        question: "Which road should be repaired first?".into(),
        options: options.iter().map(|o| o.to_string()).collect(),
        allow_multiple,
        max_choices: None,
        start_at: None,
        end_at: None,
        show_results: true,
    }
}

fn option_id(poll: &PollView, text: &str) -> String {
    poll.options.iter().find(|o| o.text == text).unwrap().id.clone()
}

fn votes(poll: &PollView, text: &str) -> Option<i32> {
    poll.options.iter().find(|o| o.text == text).unwrap().votes_count
}

#[test]
fn second_vote_is_rejected_and_counts_stay() {
    let harness = Harness::new();
    let admin = harness.admin();
    let voter = harness.device("voter-device");
    let polls = &harness.services.polls;

    let poll = polls.create(&admin, &poll_input(&["O1", "O2", "O3"], false)).unwrap();
    let o1 = option_id(&poll, "O1");
    let o2 = option_id(&poll, "O2");

    let first = polls.vote(&voter, &poll.id, &VoteInput { option_ids: vec![o1] }).unwrap();
    assert_eq!(first.vote.outcome, Outcome::Recorded);
    assert_eq!(votes(&first.poll, "O1"), Some(1));

    let second = polls.vote(&voter, &poll.id, &VoteInput { option_ids: vec![o2] });
    assert!(matches!(second, Err(CivicError::AlreadyContributed(_))));

    let after = polls.get(Some(&voter), None, &poll.id).unwrap();
    assert!(after.has_voted);
    assert_eq!(votes(&after, "O1"), Some(1));
    assert_eq!(votes(&after, "O2"), Some(0));
    assert_eq!(after.total_voters, Some(1));
}

#[test]
fn selecting_every_option_is_rejected() {
    let harness = Harness::new();
    let admin = harness.admin();
    let voter = harness.device("voter-device");
    let polls = &harness.services.polls;

    for allow_multiple in [false, true] {
        let poll = polls.create(&admin, &poll_input(&["O1", "O2"], allow_multiple)).unwrap();
        let all = vec![option_id(&poll, "O1"), option_id(&poll, "O2")];

        let result = polls.vote(&voter, &poll.id, &VoteInput { option_ids: all });
        assert!(
            matches!(result, Err(CivicError::InvalidContribution(_))),
            "allow_multiple={} should reject all options",
            allow_multiple
        );

        let untouched = polls.get(Some(&voter), None, &poll.id).unwrap();
        assert!(!untouched.has_voted);
        assert_eq!(votes(&untouched, "O1"), Some(0));
    }
}

#[test]
fn reaction_replaces_and_share_is_recorded_once() {
    let harness = Harness::new();
    let admin = harness.admin();
    let reader = harness.device("reader-device");
    let feeds = &harness.services.feeds;

    let feed = feeds
        .create(
            &admin,
            &FeedInput {
                description: "Water supply interrupted on Tuesday".into(),
                institution_id: None,
                link: None,
            },
            None,
            None,
        )
        .unwrap();

    let r1 = feeds.react(&reader, &feed.id, &ReactInput { reaction: "like".into() }).unwrap();
    assert_eq!(r1.outcome, Outcome::Recorded);
    let r2 = feeds.react(&reader, &feed.id, &ReactInput { reaction: "cry".into() }).unwrap();
    assert_eq!(r2.outcome, Outcome::Replaced);

    feeds.share(&reader, &feed.id, &ShareInput::default()).unwrap();

    let listed = feeds.list(Some(&reader), None, &FeedQuery::default()).unwrap();
    let view = listed.iter().find(|f| f.id == feed.id).unwrap();
    assert_eq!(view.total_reactions, 1);
    assert_eq!(view.reactions["cry"], 1);
    assert_eq!(view.reactions["like"], 0);
    assert_eq!(view.my_reaction.as_deref(), Some("cry"));
    assert_eq!(view.share_count, 1);

    // Impressions count once per viewer
    assert_eq!(view.impressions, 1);
    let again = feeds.list(Some(&reader), None, &FeedQuery::default()).unwrap();
    assert_eq!(again[0].impressions, 1);
}

#[test]
fn contributions_made_before_registration_stay_with_the_account() {
    let harness = Harness::new();
    let admin = harness.admin();
    let polls = &harness.services.polls;
    let feeds = &harness.services.feeds;

    let poll = polls.create(&admin, &poll_input(&["O1", "O2", "O3"], false)).unwrap();
    let feed = feeds
        .create(
            &admin,
            &FeedInput {
                description: "Road closure on Morogoro Rd".into(),
                institution_id: None,
                link: None,
            },
            None,
            None,
        )
        .unwrap();

    let anon = harness.device("dev-1");
    polls
        .vote(&anon, &poll.id, &VoteInput { option_ids: vec![option_id(&poll, "O1")] })
        .unwrap();
    feeds.react(&anon, &feed.id, &ReactInput { reaction: "like".into() }).unwrap();
    feeds.share(&anon, &feed.id, &ShareInput::default()).unwrap();
    feeds.list(Some(&anon), None, &FeedQuery::default()).unwrap();

    harness
        .services
        .users
        .register(
            None,
            Some("dev-1"),
            &RegisterInput {
                username: "amina".into(),
                password: "nyumba-123".into(),
                phone_number: None,
                role: None,
                institution_id: None,
                department_id: None,
            },
        )
        .unwrap();
    let account = harness.login("amina", "nyumba-123");
    assert_eq!(account.id, anon.id);

    let second = polls.vote(&account, &poll.id, &VoteInput { option_ids: vec![option_id(&poll, "O2")] });
    assert!(matches!(second, Err(CivicError::AlreadyContributed(_))));

    let seen = polls.get(Some(&account), None, &poll.id).unwrap();
    assert!(seen.has_voted);
    assert_eq!(votes(&seen, "O1"), Some(1));
    assert_eq!(votes(&seen, "O2"), Some(0));
    assert_eq!(seen.total_voters, Some(1));

    // Reacting again replaces the earlier reaction instead of adding one
    let again = feeds.react(&account, &feed.id, &ReactInput { reaction: "love".into() }).unwrap();
    assert_eq!(again.outcome, Outcome::Replaced);

    let listed = feeds.list(Some(&account), None, &FeedQuery::default()).unwrap();
    let view = listed.iter().find(|f| f.id == feed.id).unwrap();
    assert_eq!(view.total_reactions, 1);
    assert_eq!(view.my_reaction.as_deref(), Some("love"));
    assert_eq!(view.share_count, 1);
    assert_eq!(view.impressions, 1);
}
