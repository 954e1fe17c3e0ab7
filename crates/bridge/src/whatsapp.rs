//! WhatsApp Web surface constants and URL builders.
//!
//! Everything selector-shaped lives here so the rest of the system treats
//! the web app as an opaque "send text to contact" capability.

/// The messaging web application entry point
pub const HOME_URL: &str = "https://web.whatsapp.com";

/// Present only when the session is authenticated
pub const AUTHENTICATED_MARKER: &str = "[aria-label=\"Chats\"]";

/// The login challenge container; `data-ref` carries the challenge payload
pub const CHALLENGE_SELECTOR: &str = "div[data-ref]";

/// Attribute holding the challenge payload (changes on re-render)
pub const CHALLENGE_ATTR: &str = "data-ref";

/// The message composition surface inside a recipient-scoped view
pub const COMPOSER_SELECTOR: &str = "[aria-placeholder=\"Type a message\"]";

/// Menu path used by the logout flow
pub const MENU_SELECTOR: &str = "div[aria-label=\"Menu\"]";
pub const LOGOUT_ITEM_SELECTOR: &str = "div[aria-label=\"Log out\"]";
pub const LOGOUT_CONFIRM_SELECTOR: &str = "div[aria-label=\"Log out?\"] button:nth-of-type(2)";

/// Recipient-scoped context for a phone number, with the text prefilled
pub fn send_url(phone: &str, text: &str) -> String {
    format!(
        "{}/send?phone={}&text={}",
        HOME_URL,
        urlencoding::encode(phone),
        urlencoding::encode(text)
    )
}
