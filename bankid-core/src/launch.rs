//! Deep links that start the BankID app for an order.

/// Links that start the BankID app on the user's device.
///
/// All platforms except iOS should open `url`. iOS needs the web-triggered
/// `ios_url` instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchUrls {
    /// `bankid:` scheme link.
    pub url: String,
    /// Universal link for iOS.
    pub ios_url: String,
}

/// Passed to the launcher when an order has been created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchInfo {
    /// `bankid:` scheme link.
    pub url: String,
    /// Universal link for iOS.
    pub ios_url: String,
    /// The order that was created.
    pub order_ref: String,
}

impl LaunchInfo {
    /// Combines the links for `auto_start_token` with `order_ref`.
    #[must_use]
    pub fn new(auto_start_token: &str, order_ref: &str) -> Self {
        let LaunchUrls { url, ios_url } = launch_urls(auto_start_token);
        Self {
            url,
            ios_url,
            order_ref: order_ref.to_string(),
        }
    }
}

/// Builds the app launch links for `auto_start_token`. The token is inserted as is.
///
/// Format: `bankid:///?autostarttoken=<token>&redirect=null`, and the same query on
/// `https://app.bankid.com/` for iOS. The token is not wrapped in brackets.
#[must_use]
pub fn launch_urls(auto_start_token: &str) -> LaunchUrls {
    let launch_params = format!("/?autostarttoken={auto_start_token}&redirect=null");
    LaunchUrls {
        url: format!("bankid://{launch_params}"),
        ios_url: format!("https://app.bankid.com{launch_params}"),
    }
}
