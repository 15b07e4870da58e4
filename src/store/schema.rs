diesel::table! {
    chats (jid) {
        jid -> Text,
        name -> Nullable<Text>,
        last_message_text -> Nullable<Text>,
        last_message_ts -> Nullable<BigInt>,
        last_message_type -> Nullable<Text>,
        last_message_sender -> Nullable<Text>,
        unread_count -> Integer,
        archived -> Bool,
        avatar -> Nullable<Binary>,
        history_baseline_ts -> Nullable<BigInt>,
        last_synced_at -> Nullable<BigInt>,
        history_complete -> Bool,
    }
}

diesel::table! {
    messages (id) {
        id -> Text,
        chat_jid -> Text,
        from_me -> Bool,
        msg_type -> Text,
        content -> Nullable<Text>,
        timestamp -> BigInt,
        status -> Text,
        quoted_id -> Nullable<Text>,
        sender_name -> Nullable<Text>,
        collection_session -> Text,
    }
}

diesel::table! {
    contacts (jid) {
        jid -> Text,
        name -> Nullable<Text>,
        phone -> Nullable<Text>,
        avatar -> Nullable<Binary>,
        blocked -> Bool,
    }
}

diesel::table! {
    media (id) {
        id -> Text,
        message_id -> Text,
        file_path -> Nullable<Text>,
        file_name -> Nullable<Text>,
        file_size -> Nullable<BigInt>,
        mime_type -> Nullable<Text>,
    }
}

diesel::table! {
    settings (key) {
        key -> Text,
        value -> Text,
    }
}

diesel::joinable!(messages -> chats (chat_jid));
diesel::joinable!(media -> messages (message_id));

diesel::allow_tables_to_appear_in_same_query!(chats, messages, contacts, media, settings);
