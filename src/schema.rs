// Table definitions for the netcheck store.
// Kept in sync by hand with the CREATE TABLE statements in db.rs.

diesel::table! {
    session (id) {
        id -> Text,
        created -> BigInt,
    }
}

diesel::table! {
    pings (id) {
        id -> Integer,
        session_id -> Text,
        nbytes -> BigInt,
        ip_addr -> Text,
        icmp_seq -> BigInt,
        time_ms -> Double,
    }
}

diesel::table! {
    summary (id) {
        id -> Integer,
        session_id -> Text,
        n_transmitted -> BigInt,
        n_received -> BigInt,
        packet_loss -> Double,
    }
}
