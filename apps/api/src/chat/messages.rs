// User-facing chat texts.

/// Shown when `WELCOME_MESSAGE` is unset.
pub const DEFAULT_WELCOME: &str = "Hey there! Looking for your next YC startup role?
Drop your role, preferred location, salary range, visa needs, and full-time or contract. More detail = smarter matches.

Example:
Senior/AI PM • Bellevue or remote • $180–220k • Needs H-1B sponsorship • Full-time

Full Stack engineer • San Francisco • at least $150 • Full-time

Find the best fitting PM jobs for me from YC startup targeting to B2B AI infra market, within 10 persons. I can work remotely or onsite in Bellevue. Please also consider the founders previous exp, the industry trend, org culture and candidates persona. I don't need visa sponsorship.";

pub const FILE_MESSAGE: &str = "Please analyze this resume";
pub const FILE_QUERY_PREFIX: &str = "I have attached my resume for analysis. ";
pub const FILE_ONLY_QUERY: &str = "Please analyze my resume and provide feedback.";
pub const LINKEDIN_DEFAULT_MESSAGE: &str = "Please analyze my LinkedIn profile";

pub const API_CONFIG_ERROR: &str = "❌ API configuration error: check that DIFY_API_KEY in your .env file is correct.

Please make sure:
1. The API key starts with \"app-\"
2. The API key belongs to a published Dify app
3. API access is enabled for the app
4. Your network connection is working";
pub const FILE_ANALYSIS_ERROR: &str =
    "Sorry, the file analysis failed. Please check the file format and try again.";
pub const LINKEDIN_ANALYSIS_ERROR: &str =
    "Sorry, the LinkedIn profile analysis failed. Please check that the link is valid and try again.";
pub const GENERIC_ERROR: &str = "Sorry, I can't reply to your message right now. Please try again later.";

/// Welcome text with literal `\n` sequences from the environment unescaped.
pub fn welcome_message(configured: Option<&str>) -> String {
    match configured {
        Some(message) => message.replace("\\n", "\n"),
        None => DEFAULT_WELCOME.to_string(),
    }
}
