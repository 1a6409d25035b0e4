mod common;

use civic_intake::services::analytics_service::AnalyticsQuery;
use civic_intake::services::announcement_service::{AnnouncementInput, AnnouncementPatch, PREVIEW_CHARS};
use civic_intake::services::feed_service::{FeedInput, ReactInput};
use civic_intake::services::message_service::SendMessageInput;
use civic_intake::services::poll_service::{PollInput, VoteInput};
use civic_intake::CivicError;
use common::Harness;

fn message(institution_id: &str, problem_type: Option<&str>) -> SendMessageInput {
    SendMessageInput {
        institution_id: institution_id.into(),
        department_id: None,
        problem_type: problem_type.map(str::to_string),
        other_problem: None,
        content: "Needs attention".into(),
        ward: "Kariakoo".into(),
        street: "Msimbazi".into(),
        sub_street: None,
        phone_number: None,
    }
}

#[test]
fn announcements_list_previews_and_detail_shows_everything() {
    let harness = Harness::new();
    let admin = harness.admin();
    let citizen = harness.device("reader-1");
    let announcements = &harness.services.announcements;

    let long = "Water will be rationed in Ilala district. ".repeat(20);
    let created = announcements
        .create(
            &admin,
            &AnnouncementInput {
                title: "Water rationing".into(),
                description: long.clone(),
            },
        )
        .unwrap();
    assert!(matches!(
        announcements.create(
            &citizen,
            &AnnouncementInput {
                title: "Spam".into(),
                description: "x".into(),
            },
        ),
        Err(CivicError::Forbidden(_))
    ));

    let listed = announcements.list(50, 0).unwrap();
    assert_eq!(listed.len(), 1);
    assert!(listed[0].is_truncated);
    assert!(listed[0].preview.chars().count() <= PREVIEW_CHARS + 1);
    assert!(long.starts_with(listed[0].preview.trim_end_matches('\u{2026}')));

    let detail = announcements.get(&created.announcement.id).unwrap();
    assert_eq!(detail.announcement.description, long);

    let renamed = announcements
        .update(
            &admin,
            &created.announcement.id,
            &AnnouncementPatch {
                title: Some("Rationing schedule".into()),
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(renamed.announcement.title, "Rationing schedule");
    assert_eq!(renamed.announcement.description, long);

    announcements.delete(&admin, &created.announcement.id).unwrap();
    assert!(announcements.list(50, 0).unwrap().is_empty());
}

#[test]
fn admin_stats_count_messages_votes_and_reactions() {
    let harness = Harness::new();
    let admin = harness.admin();
    let water = harness.institution(&admin, "Water Authority");
    let roads = harness.institution(&admin, "Roads Agency");
    let services = &harness.services;

    let first = harness.device("citizen-1");
    let second = harness.device("citizen-2");
    services.messages.send(&first, &message(&water, Some("water")), None).unwrap();
    services.messages.send(&second, &message(&water, Some("water")), None).unwrap();
    services.messages.send(&second, &message(&roads, None), None).unwrap();

    let poll = services
        .polls
        .create(
            &admin,
            &PollInput {
                question: "Which road first?".into(),
                options: vec!["North".into(), "South".into()],
                allow_multiple: false,
                max_choices: None,
                start_at: None,
                end_at: None,
                show_results: true,
            },
        )
        .unwrap();
    let north = poll.options.iter().find(|o| o.text == "North").unwrap().id.clone();
    for voter in [&first, &second] {
        services
            .polls
            .vote(voter, &poll.id, &VoteInput { option_ids: vec![north.clone()] })
            .unwrap();
    }

    let feed = services
        .feeds
        .create(
            &admin,
            &FeedInput {
                description: "Road works this week".into(),
                institution_id: Some(roads.clone()),
                link: None,
            },
            None,
            None,
        )
        .unwrap();
    services
        .feeds
        .react(&first, &feed.id, &ReactInput { reaction: "love".into() })
        .unwrap();

    let stats = services
        .analytics
        .admin_stats(
            &admin,
            &AnalyticsQuery {
                per_feed: Some("true".into()),
                ..Default::default()
            },
        )
        .unwrap();

    assert_eq!(stats.problem_type_stats[0].problem_type, "water");
    assert_eq!(stats.problem_type_stats[0].count, 2);
    assert_eq!(stats.messages_by_institution[0].institution_name, "Water Authority");
    assert_eq!(stats.messages_by_institution[0].count, 2);

    let poll_stats = stats.poll_stats.iter().find(|p| p.poll_id == poll.id).unwrap();
    assert_eq!(poll_stats.total_voters, 2);
    let north_votes = poll_stats.options.iter().find(|o| o.option_id == north).unwrap();
    assert_eq!(north_votes.votes_count, 2);

    assert_eq!(stats.feed_reactions.total, 1);
    assert_eq!(stats.feed_reactions.by_type["love"], 1);
    assert_eq!(stats.feed_reactions.by_type["like"], 0);
    assert_eq!(stats.feed_reactions.per_feed.len(), 1);
    assert_eq!(stats.feed_reactions.per_feed[0].feed_id, feed.id);

    let roads_only = services
        .analytics
        .admin_stats(
            &admin,
            &AnalyticsQuery {
                institution: Some(roads.clone()),
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(roads_only.messages_by_institution.len(), 1);
    assert_eq!(roads_only.problem_type_stats[0].problem_type, "other");

    assert!(matches!(
        services.analytics.admin_stats(&first, &AnalyticsQuery::default()),
        Err(CivicError::Forbidden(_))
    ));
}
