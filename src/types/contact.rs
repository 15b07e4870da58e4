/// An address-book entry. Shares the jid address space with chats and
/// augments (but does not own) the matching chat record.
#[derive(Debug, Clone, Default)]
pub struct Contact {
    pub jid: String,
    pub name: Option<String>,
    pub phone: Option<String>,
    pub avatar: Option<Vec<u8>>,
    pub blocked: bool,
}
