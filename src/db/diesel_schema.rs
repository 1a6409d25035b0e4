// Hand-maintained to match the DDL in schema.rs.

diesel::table! {
    institutions (id) {
        id -> Text,
        name -> Text,
        created_at -> Text,
    }
}

diesel::table! {
    departments (id) {
        id -> Text,
        institution_id -> Text,
        name -> Text,
        created_at -> Text,
    }
}

diesel::table! {
    principals (id) {
        id -> Text,
        username -> Text,
        password_hash -> Nullable<Text>,
        role -> Text,
        institution_id -> Nullable<Text>,
        department_id -> Nullable<Text>,
        device_id -> Nullable<Text>,
        phone_number -> Nullable<Text>,
        is_active -> Integer,
        token_version -> Integer,
        created_at -> Text,
        updated_at -> Text,
    }
}

diesel::table! {
    reports (id) {
        id -> Text,
        author_id -> Text,
        device_id -> Nullable<Text>,
        institution_id -> Nullable<Text>,
        department_id -> Nullable<Text>,
        title -> Text,
        description -> Text,
        latitude -> Double,
        longitude -> Double,
        status -> Text,
        distance_km -> Nullable<Double>,
        route_info -> Nullable<Text>,
        created_at -> Text,
        updated_at -> Text,
    }
}

diesel::table! {
    messages (id) {
        id -> Text,
        sender_id -> Text,
        device_id -> Nullable<Text>,
        institution_id -> Text,
        department_id -> Nullable<Text>,
        problem_type -> Nullable<Text>,
        other_problem -> Nullable<Text>,
        content -> Text,
        ward -> Nullable<Text>,
        street -> Nullable<Text>,
        sub_street -> Nullable<Text>,
        phone_number -> Nullable<Text>,
        attachment_path -> Nullable<Text>,
        attachment_name -> Nullable<Text>,
        status -> Text,
        reply_count -> Integer,
        created_at -> Text,
        updated_at -> Text,
    }
}

diesel::table! {
    replies (id) {
        id -> Text,
        message_id -> Text,
        sender_id -> Text,
        sender_role -> Text,
        content -> Text,
        attachment_path -> Nullable<Text>,
        attachment_name -> Nullable<Text>,
        created_at -> Text,
    }
}

diesel::table! {
    polls (id) {
        id -> Text,
        question -> Text,
        allow_multiple -> Integer,
        max_choices -> Nullable<Integer>,
        start_at -> Nullable<Text>,
        end_at -> Nullable<Text>,
        show_results -> Integer,
        created_by -> Text,
        created_at -> Text,
        updated_at -> Text,
    }
}

diesel::table! {
    poll_options (id) {
        id -> Text,
        poll_id -> Text,
        text -> Text,
        position -> Integer,
        votes_count -> Integer,
    }
}

diesel::table! {
    poll_votes (id) {
        id -> Text,
        poll_id -> Text,
        principal_id -> Nullable<Text>,
        device_id -> Nullable<Text>,
        created_at -> Text,
    }
}

diesel::table! {
    poll_vote_selections (vote_id, option_id) {
        vote_id -> Text,
        option_id -> Text,
    }
}

diesel::table! {
    feeds (id) {
        id -> Text,
        posted_by -> Text,
        institution_id -> Nullable<Text>,
        description -> Text,
        image_path -> Nullable<Text>,
        video_path -> Nullable<Text>,
        link -> Nullable<Text>,
        impressions -> Integer,
        created_at -> Text,
        updated_at -> Text,
    }
}

diesel::table! {
    feed_reactions (id) {
        id -> Text,
        feed_id -> Text,
        principal_id -> Nullable<Text>,
        device_id -> Nullable<Text>,
        reaction -> Text,
        created_at -> Text,
    }
}

diesel::table! {
    feed_shares (id) {
        id -> Text,
        feed_id -> Text,
        principal_id -> Nullable<Text>,
        device_id -> Nullable<Text>,
        message -> Nullable<Text>,
        created_at -> Text,
    }
}

diesel::table! {
    feed_impressions (id) {
        id -> Text,
        feed_id -> Text,
        principal_id -> Nullable<Text>,
        device_id -> Nullable<Text>,
        created_at -> Text,
    }
}

diesel::table! {
    notifications (id) {
        id -> Text,
        recipient_id -> Text,
        title -> Text,
        body -> Text,
        kind -> Text,
        object_kind -> Text,
        object_id -> Text,
        read_at -> Nullable<Text>,
        created_at -> Text,
    }
}

diesel::table! {
    push_devices (id) {
        id -> Text,
        principal_id -> Text,
        token -> Text,
        platform -> Text,
        is_active -> Integer,
        created_at -> Text,
        updated_at -> Text,
    }
}

diesel::table! {
    announcements (id) {
        id -> Text,
        title -> Text,
        description -> Text,
        created_by -> Nullable<Text>,
        created_at -> Text,
        updated_at -> Text,
    }
}

diesel::joinable!(departments -> institutions (institution_id));
diesel::joinable!(replies -> messages (message_id));
diesel::joinable!(poll_options -> polls (poll_id));
diesel::joinable!(poll_votes -> polls (poll_id));
diesel::joinable!(poll_vote_selections -> poll_votes (vote_id));
diesel::joinable!(poll_vote_selections -> poll_options (option_id));
diesel::joinable!(feed_reactions -> feeds (feed_id));
diesel::joinable!(feed_shares -> feeds (feed_id));
diesel::joinable!(feed_impressions -> feeds (feed_id));
diesel::joinable!(notifications -> principals (recipient_id));
diesel::joinable!(push_devices -> principals (principal_id));

diesel::allow_tables_to_appear_in_same_query!(
    institutions,
    departments,
    principals,
    reports,
    messages,
    replies,
    polls,
    poll_options,
    poll_votes,
    poll_vote_selections,
    feeds,
    feed_reactions,
    feed_shares,
    feed_impressions,
    notifications,
    push_devices,
    announcements,
);
