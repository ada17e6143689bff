use chrono::NaiveDate;

use cinestream_common::{CityKey, MovieCandidate, TheaterCandidate};

use crate::decomposer::{ExtractionStep, StepTask};

/// System prompt shared by every step.
pub fn system_prompt(today: NaiveDate) -> String {
    format!(
        "You research cinema listings on the web for a showtime aggregator. \
Today is {today}. Use web search to find official cinema and ticketing pages. \
Report only what the sources state; never invent titles, theaters or times. \
Record every start time in RFC 3339 with the theater's local UTC offset. \
Skip screenings that have already started or begin within the next hour. \
Always answer by calling the provided tool."
    )
}

/// User prompt for one step.
pub fn step_prompt(step: &ExtractionStep) -> String {
    let location = location_block(&step.city);
    match &step.task {
        StepTask::TheaterDiscovery => format!(
            "{location}\n\n\
List every cinema currently operating in this city. Include the major chains \
for the country as well as independent cinemas. Give each cinema's name, \
street address and official website."
        ),
        StepTask::MovieDiscovery { theaters, attempt } => {
            let retry = if *attempt > 1 {
                "\n\nAn earlier search found nothing. Try the cinemas' own schedule \
pages and local ticketing sites."
            } else {
                ""
            };
            format!(
                "{location}\n\n{}\n\n\
List the movies currently showing or scheduled in these cinemas. For each movie \
give its English title if one exists, the local title as the cinemas show it, \
and a direct link to an official poster image if you find one.{retry}",
                theater_block(theaters)
            )
        }
        StepTask::MovieDay {
            movie,
            day,
            theaters,
            horizon,
            extension,
        } => {
            let beyond = if *extension {
                format!(
                    "\n\nIf a schedule page also lists this movie on {horizon} or later, \
include those showtimes too."
                )
            } else {
                String::new()
            };
            format!(
                "{location}\n\n{}\n\n\
Find every showtime of {} on {day} across these cinemas. For each showtime give \
the start time, the format (2D, 3D, IMAX, 4DX...), the audio language or subtitles, \
and the hall when listed. Leave out cinemas that do not show it that day.{beyond}",
                theater_block(theaters),
                movie_label(movie)
            )
        }
    }
}

fn location_block(city: &CityKey) -> String {
    let mut lines = vec![format!("Location: {city}"), format!("- City: {}", city.city())];
    if let Some(region) = city.region() {
        lines.push(format!("- Region: {region}"));
    }
    lines.push(format!(
        "- Country: {}",
        city.country().unwrap_or("not specified, infer from the city")
    ));
    lines.join("\n")
}

fn theater_block(theaters: &[TheaterCandidate]) -> String {
    if theaters.is_empty() {
        return "Known cinemas: none yet, search for them.".to_string();
    }
    let listed: Vec<String> = theaters
        .iter()
        .map(|t| {
            if t.address.is_empty() {
                format!("- {}", t.name)
            } else {
                format!("- {} ({})", t.name, t.address)
            }
        })
        .collect();
    format!("Known cinemas:\n{}", listed.join("\n"))
}

fn movie_label(movie: &MovieCandidate) -> String {
    let mut titles: Vec<&str> = Vec::new();
    if let Some(en) = movie.titles.get("en") {
        titles.push(en);
    }
    for (lang, title) in &movie.titles {
        if lang != "en" && !titles.contains(&title.as_str()) {
            titles.push(title);
        }
    }
    match titles.as_slice() {
        [] => "the movie".to_string(),
        [only] => format!("\"{only}\""),
        [first, rest @ ..] => format!("\"{first}\" (also listed as \"{}\")", rest.join("\", \"")),
    }
}
