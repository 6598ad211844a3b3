diesel::table! {
    support_tickets (id) {
        id -> Uuid,
        org_id -> Uuid,
        ticket_number -> Varchar,
        subject -> Varchar,
        description -> Nullable<Text>,
        status -> Varchar,
        priority -> Varchar,
        category -> Nullable<Varchar>,
        source -> Varchar,
        requester_id -> Nullable<Uuid>,
        assignee_id -> Nullable<Uuid>,
        team_id -> Nullable<Uuid>,
        due_date -> Nullable<Timestamptz>,
        first_response_at -> Nullable<Timestamptz>,
        resolved_at -> Nullable<Timestamptz>,
        closed_at -> Nullable<Timestamptz>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    ticket_activities (id) {
        id -> Uuid,
        ticket_id -> Uuid,
        user_id -> Nullable<Uuid>,
        action -> Varchar,
        description -> Text,
        details -> Jsonb,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    ticket_comments (id) {
        id -> Uuid,
        ticket_id -> Uuid,
        author_id -> Nullable<Uuid>,
        content -> Text,
        is_internal -> Bool,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    users (id) {
        id -> Uuid,
        org_id -> Uuid,
        email -> Varchar,
        display_name -> Varchar,
        role -> Varchar,
        is_active -> Bool,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    notifications (id) {
        id -> Uuid,
        user_id -> Uuid,
        kind -> Varchar,
        ticket_id -> Nullable<Uuid>,
        payload -> Jsonb,
        is_read -> Bool,
        read_at -> Nullable<Timestamptz>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    notification_preferences (id) {
        id -> Uuid,
        user_id -> Uuid,
        kind -> Varchar,
        email_enabled -> Bool,
        push_enabled -> Bool,
        digest -> Varchar,
        quiet_hours_start -> Nullable<Time>,
        quiet_hours_end -> Nullable<Time>,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    notification_delivery_log (id) {
        id -> Uuid,
        notification_id -> Uuid,
        channel -> Varchar,
        status -> Varchar,
        attempts -> Int4,
        last_error -> Nullable<Text>,
        next_attempt_at -> Timestamptz,
        sent_at -> Nullable<Timestamptz>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    assignment_rules (id) {
        id -> Uuid,
        org_id -> Uuid,
        position -> Int4,
        category -> Nullable<Varchar>,
        priority -> Nullable<Varchar>,
        source -> Nullable<Varchar>,
        assignee_id -> Nullable<Uuid>,
        team_id -> Nullable<Uuid>,
        is_active -> Bool,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    push_subscriptions (id) {
        id -> Uuid,
        user_id -> Uuid,
        endpoint -> Varchar,
        p256dh_key -> Varchar,
        auth_key -> Varchar,
        is_active -> Bool,
        created_at -> Timestamptz,
    }
}

diesel::joinable!(ticket_activities -> support_tickets (ticket_id));
diesel::joinable!(ticket_comments -> support_tickets (ticket_id));
diesel::joinable!(notification_delivery_log -> notifications (notification_id));
diesel::joinable!(push_subscriptions -> users (user_id));

diesel::allow_tables_to_appear_in_same_query!(
    support_tickets,
    ticket_activities,
    ticket_comments,
    users,
    notifications,
    notification_preferences,
    notification_delivery_log,
    assignment_rules,
    push_subscriptions,
);
