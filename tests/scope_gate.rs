mod common;

use civic_intake::db::reports::ReportQuery;
use civic_intake::services::message_service::{ReplyInput, SendMessageInput};
use civic_intake::services::report_service::{CreateReportInput, ReportStatusInput};
use civic_intake::CivicError;
use common::Harness;

fn report(title: &str, institution_id: Option<&str>) -> CreateReportInput {
    CreateReportInput {
        title: title.into(),
        description: "Reported from the field".into(),
        latitude: -6.8,
        longitude: 39.28,
        institution_id: institution_id.map(str::to_string),
        department_id: None,
    }
}

fn status(value: &str) -> ReportStatusInput {
    ReportStatusInput {
        status: value.into(),
        distance_km: None,
        route_info: None,
    }
}

#[test]
fn anonymous_devices_only_see_their_own_reports() {
    let harness = Harness::new();
    let reports = &harness.services.reports;

    let abc = harness.device("abc123");
    assert_eq!(abc.username, "anon_abc123");
    let filed = reports.create(&abc, &report("Pothole on Main St", None)).unwrap();
    assert_eq!(filed.device_id.as_deref(), Some("abc123"));

    let mine = reports.list(Some(&abc), &ReportQuery::default()).unwrap();
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0].id, filed.id);

    let xyz = harness.device("xyz999");
    assert!(reports.list(Some(&xyz), &ReportQuery::default()).unwrap().is_empty());
    // Another device cannot even learn the report exists
    assert!(matches!(reports.get(&xyz, &filed.id), Err(CivicError::NotFound(_))));

    // A caller the store has never seen lists nothing
    assert!(reports.list(None, &ReportQuery::default()).unwrap().is_empty());
}

#[test]
fn institution_staff_never_cross_institutions() {
    let harness = Harness::new();
    let admin = harness.admin();
    let water = harness.institution(&admin, "Water Authority");
    let roads = harness.institution(&admin, "Roads Agency");
    let water_staff = harness.institution_staff(&admin, "water.clerk", &water);

    let reports = &harness.services.reports;
    let citizen = harness.device("citizen-1");
    let leak = reports.create(&citizen, &report("Burst pipe", Some(&water))).unwrap();
    let crack = reports.create(&citizen, &report("Cracked bridge", Some(&roads))).unwrap();

    let visible = reports.list(Some(&water_staff), &ReportQuery::default()).unwrap();
    assert_eq!(visible.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(), vec![leak.id.as_str()]);

    assert!(matches!(reports.get(&water_staff, &crack.id), Err(CivicError::Forbidden(_))));
    assert!(matches!(
        reports.update_status(&water_staff, &crack.id, &status("solved")),
        Err(CivicError::Forbidden(_))
    ));
    let updated = reports.update_status(&water_staff, &leak.id, &status("solving")).unwrap();
    assert_eq!(updated.status, "solving");

    // Admins see everything
    assert_eq!(reports.list(Some(&admin), &ReportQuery::default()).unwrap().len(), 2);

    // The citizen hears about the status change
    let inbox = harness
        .services
        .notifications
        .list(&citizen, &Default::default())
        .unwrap();
    assert_eq!(inbox.unread, 1);
}

#[test]
fn staff_reply_is_scoped_and_answers_the_message() {
    let harness = Harness::new();
    let admin = harness.admin();
    let water = harness.institution(&admin, "Water Authority");
    let roads = harness.institution(&admin, "Roads Agency");
    let water_staff = harness.institution_staff(&admin, "water.clerk", &water);
    let roads_staff = harness.institution_staff(&admin, "roads.clerk", &roads);

    let messages = &harness.services.messages;
    let citizen = harness.device("citizen-2");
    let message = messages
        .send(
            &citizen,
            &SendMessageInput {
                institution_id: water.clone(),
                department_id: None,
                problem_type: Some("water".into()),
                other_problem: None,
                content: "No water since yesterday".into(),
                ward: "Kariakoo".into(),
                street: "Msimbazi".into(),
                sub_street: None,
                phone_number: None,
            },
            None,
        )
        .unwrap();

    let reply = ReplyInput {
        content: "A crew is on the way".into(),
    };
    assert!(matches!(
        messages.reply(&roads_staff, &message.id, &reply, None),
        Err(CivicError::Forbidden(_))
    ));
    messages.reply(&water_staff, &message.id, &reply, None).unwrap();

    let seen = messages.get(&citizen, &message.id).unwrap();
    assert_eq!(seen.status, "answered");
    let page = messages.list_replies(&citizen, &message.id, 1).unwrap();
    assert_eq!(page.results.len(), 1);
}
