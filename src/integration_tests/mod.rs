mod broker;
mod end_to_end;
mod live;
