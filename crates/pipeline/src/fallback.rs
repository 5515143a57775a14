//! Templated fallback answers and suggested follow-ups, keyed by intent.
//! Used when generation fails, and the follow-ups ride along on every
//! response.

use tably_core::intent::Intent;

pub fn fallback_answer(intent: Intent, business_name: Option<&str>) -> String {
    let name = business_name.unwrap_or("our team");
    match intent {
        Intent::MenuInquiry => format!(
            "I couldn't pull up the menu just now. Please ask {name} directly or try again in a moment."
        ),
        Intent::HoursPolicy => format!(
            "I couldn't confirm hours or policies right now. {name} can confirm them directly."
        ),
        Intent::Pricing => {
            "I can't confirm prices at the moment. Please check back shortly.".to_string()
        }
        Intent::DietaryRestriction => format!(
            "I couldn't verify dietary details just now. To be safe, please confirm allergens with {name}."
        ),
        Intent::Location => {
            "I couldn't look up location details right now. Please try again shortly.".to_string()
        }
        Intent::Complaint => format!(
            "I'm sorry about the experience. I've noted your message and {name} will follow up."
        ),
        Intent::GeneralChat | Intent::Unknown => {
            "I'm having trouble answering right now, but I'm happy to help with questions about the menu, hours, or policies.".to_string()
        }
    }
}

pub fn follow_ups(intent: Intent) -> Vec<String> {
    let suggestions: &[&str] = match intent {
        Intent::MenuInquiry => &[
            "What are today's specials?",
            "Do you have vegetarian options?",
            "What do you recommend?",
        ],
        Intent::HoursPolicy => &[
            "Are you open on holidays?",
            "Do you take reservations?",
            "What is your cancellation policy?",
        ],
        Intent::Pricing => &["Do you have lunch deals?", "Is there a minimum for delivery?"],
        Intent::DietaryRestriction => &[
            "Which dishes are gluten-free?",
            "Can dishes be made vegan?",
            "Do you handle nut allergies?",
        ],
        Intent::Location => &["Is parking available?", "Are you near public transit?"],
        Intent::Complaint => &["Would you like a manager to contact you?"],
        Intent::GeneralChat | Intent::Unknown => &[
            "What's on the menu?",
            "What are your hours?",
            "Where are you located?",
        ],
    };
    suggestions.iter().map(|s| s.to_string()).collect()
}
